use anyhow::Result;
use std::{fs, path::PathBuf};
use structopt::StructOpt;
use tch::Device;
use train::{
    config::{merge_resumed_args, Args, Experiment, ARGS_FILE_NAME},
    train::TrainingState,
    utils,
};

fn temp_experiment_dir() -> PathBuf {
    std::env::temp_dir().join(format!("resume-test-{}", uuid::Uuid::new_v4()))
}

fn parse_args(dir: &PathBuf, extra: &[&str]) -> Result<Args> {
    let dir = dir.to_str().unwrap().to_string();
    let mut argv = vec![
        "train",
        "--experiment-root",
        dir.as_str(),
        "--train-set",
        "train.csv",
        "--image-root",
        "images",
        "--model-name",
        "resnet18",
        "--head-name",
        "direct",
        "--embedding-dim",
        "8",
        "--device",
        "cpu",
    ];
    argv.extend_from_slice(extra);
    Ok(Args::from_iter_safe(&argv)?)
}

#[test]
fn fresh_experiment_stores_args() -> Result<()> {
    let dir = temp_experiment_dir();
    let args = parse_args(&dir, &["--batch-p", "18"])?;
    let experiment = Experiment::prepare(args.clone())?;

    assert!(experiment.warnings.is_empty());
    assert_eq!(experiment.args, args);

    let text = fs::read_to_string(dir.join(ARGS_FILE_NAME))?;
    let stored: serde_json::Value = serde_json::from_str(&text)?;
    assert_eq!(stored["batch_p"], 18);
    assert_eq!(stored["model_name"], "resnet18");
    assert_eq!(stored["margin"], "soft");

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn resumed_args_win_over_supplied_ones() -> Result<()> {
    let dir = temp_experiment_dir();
    Experiment::prepare(parse_args(&dir, &["--batch-p", "18"])?)?;

    let resumed = Experiment::prepare(parse_args(&dir, &["--resume", "--batch-p", "32"])?)?;
    assert_eq!(resumed.args.batch_p, 18);
    assert!(resumed.args.resume);
    assert_eq!(resumed.warnings.len(), 1);
    assert!(resumed.warnings[0].contains("batch_p"));

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn unknown_stored_args_keep_supplied_values() -> Result<()> {
    let dir = temp_experiment_dir();
    let args = parse_args(&dir, &["--resume"])?;

    let mut stored = match serde_json::to_value(&args)? {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    };
    stored.remove("seed");
    stored.insert("learning_rate".into(), serde_json::json!(1e-4));

    let (merged, warnings) = merge_resumed_args(&args, stored)?;
    assert_eq!(merged.learning_rate, 1e-4);
    assert_eq!(merged.seed, None);
    assert_eq!(warnings.len(), 2);
    Ok(())
}

#[test]
fn reject_invalid_resumed_args() -> Result<()> {
    let dir = temp_experiment_dir();
    Experiment::prepare(parse_args(&dir, &[])?)?;

    // corrupt the stored batch size to an invalid value
    let args_file = dir.join(ARGS_FILE_NAME);
    let mut stored: serde_json::Value = serde_json::from_str(&fs::read_to_string(&args_file)?)?;
    stored["batch_p"] = serde_json::json!(1);
    fs::write(&args_file, serde_json::to_string_pretty(&stored)?)?;

    // the supplied value is valid, but the stored one wins
    let result = Experiment::prepare(parse_args(&dir, &["--resume", "--batch-p", "8"])?);
    assert!(result.is_err());

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn reject_invalid_fresh_args() -> Result<()> {
    let dir = temp_experiment_dir();
    assert!(Experiment::prepare(parse_args(&dir, &["--batch-p", "1"])?).is_err());
    assert!(!dir.exists());
    Ok(())
}

#[test]
fn reject_non_empty_dir_without_resume() -> Result<()> {
    let dir = temp_experiment_dir();
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("something"), b"")?;

    assert!(Experiment::prepare(parse_args(&dir, &[])?).is_err());

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn reject_resume_without_args_file() -> Result<()> {
    let dir = temp_experiment_dir();
    fs::create_dir_all(&dir)?;

    assert!(Experiment::prepare(parse_args(&dir, &["--resume"])?).is_err());

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn resume_restores_global_step() -> Result<()> {
    let dir = temp_experiment_dir();
    let experiment = Experiment::prepare(parse_args(&dir, &[])?)?;

    let mut state = TrainingState::new(&experiment, Device::Cpu)?;
    assert_eq!(state.restore(&experiment)?, 0);
    assert!(dir.join("checkpoint-0.ot").is_file());

    state.set_global_step(1234);
    state.save(&dir)?;
    let (_path, step) = utils::latest_checkpoint(&dir)?.unwrap();
    assert_eq!(step, 1234);

    let resumed = Experiment::prepare(parse_args(&dir, &["--resume"])?)?;
    let mut state = TrainingState::new(&resumed, Device::Cpu)?;
    assert_eq!(state.restore(&resumed)?, 1234);
    assert_eq!(state.global_step(), 1234);

    fs::remove_dir_all(&dir)?;
    Ok(())
}
