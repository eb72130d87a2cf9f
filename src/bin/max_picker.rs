use nn_exercises::max_picker::{predict_file, training_loop, TrainConfig};

fn main() -> anyhow::Result<()> {
    let cfg = TrainConfig::default();
    let log = training_loop(&cfg)?;

    println!("epoch  accuracy  mean-loss");
    for (i, (acc, loss)) in log.iter().enumerate() {
        println!("{:>5}  {:>8.4}  {:>9.6}", i + 1, acc, loss);
    }

    // reload the checkpoint and classify a few fixed vectors
    let samples = vec![
        vec![0.978_890_86, 0.152_296_75, 0.310_821_23, 0.035_043_17, 0.889_208_43],
        vec![0.749_635_33, 0.552_425_6, 0.957_588_07, 0.955_204_34, 0.848_906_81],
        vec![0.007_978_68, 0.674_825_28, 0.136_258_47, 0.346_753_72, 0.198_713_92],
        vec![0.093_497_76, 0.594_166_69, 0.925_792_91, 0.415_674_12, 0.135_889_4],
    ];
    let preds = predict_file(&cfg, &samples)?;
    for (input, pred) in samples.iter().zip(preds.iter()) {
        println!("{input:?} -> {pred:?}");
    }
    Ok(())
}
