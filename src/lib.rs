//! Coursework exercises in neural-network construction and training, built on
//! candle. Each module is an independent exercise with its own runnable script
//! under `src/bin`:
//!
//! - [`similarity`]: a siamese sentence encoder trained with a cosine triplet
//!   loss.
//! - [`max_picker`]: a toy "which element is the largest" classifier with a
//!   full train/evaluate/checkpoint driver.
//! - [`ner`]: a named-entity tagger on top of a pretrained BERT encoder, with
//!   either plain cross-entropy or CRF decoding.

pub mod crf;
pub mod max_picker;
pub mod ner;
pub mod optim;
pub mod similarity;
