use crate::common::*;

const CHECKPOINT_PREFIX: &str = "checkpoint-";
const CHECKPOINT_EXTENSION: &str = "ot";

/// The checkpoint file name of a training step.
pub fn checkpoint_file_name(step: usize) -> String {
    format!("{}{}.{}", CHECKPOINT_PREFIX, step, CHECKPOINT_EXTENSION)
}

/// Save parameters to a checkpoint file in the experiment directory.
pub fn save_checkpoint(vs: &nn::VarStore, experiment_dir: &Path, step: usize) -> Result<PathBuf> {
    let path = experiment_dir.join(checkpoint_file_name(step));
    vs.save(&path)
        .with_context(|| format!("failed to save checkpoint {}", path.display()))?;
    Ok(path)
}

/// Find the checkpoint with the largest step in the experiment directory.
pub fn latest_checkpoint(experiment_dir: &Path) -> Result<Option<(PathBuf, usize)>> {
    let checkpoint_filename_regex = Regex::new(&format!(
        r"^{}(\d+)\.{}$",
        CHECKPOINT_PREFIX, CHECKPOINT_EXTENSION
    ))?;
    let pattern = format!(
        "{}/{}*.{}",
        experiment_dir.display(),
        CHECKPOINT_PREFIX,
        CHECKPOINT_EXTENSION
    );

    let paths: Vec<_> = glob::glob(&pattern)?.try_collect()?;
    let latest = paths
        .into_iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?;
            let captures = checkpoint_filename_regex.captures(file_name)?;
            let step: usize = captures.get(1)?.as_str().parse().ok()?;
            Some((path, step))
        })
        .max_by_key(|(_path, step)| *step);

    Ok(latest)
}
