//! Run arguments and the experiment directory.

use crate::common::*;
use strum::VariantNames;

/// The file storing the run arguments in the experiment directory.
pub const ARGS_FILE_NAME: &str = "args.json";
/// The text log file in the experiment directory.
pub const LOG_FILE_NAME: &str = "train.log";

/// Arguments that are never taken from a resumed experiment.
const RUNTIME_ONLY_ARGS: &[&str] = &["experiment_root", "resume"];

#[derive(Debug, Clone, PartialEq, StructOpt, Serialize, Deserialize)]
/// Train a person re-identification network.
pub struct Args {
    #[structopt(long)]
    /// Location used to store checkpoints and dumped data.
    pub experiment_root: PathBuf,

    #[structopt(long)]
    /// Path to the train set CSV file with (pid, fid) rows.
    pub train_set: Option<PathBuf>,

    #[structopt(long)]
    /// Path that will be prepended to the file IDs in the CSV file.
    pub image_root: Option<PathBuf>,

    #[structopt(long)]
    /// Resume training from the latest checkpoint of the experiment directory.
    pub resume: bool,

    #[structopt(long, default_value = "resnet50", possible_values = BackboneKind::VARIANTS)]
    /// The backbone network.
    pub model_name: BackboneKind,

    #[structopt(long, default_value = "fc1024", possible_values = HeadKind::VARIANTS)]
    /// The embedding head.
    pub head_name: HeadKind,

    #[structopt(long, default_value = "128")]
    /// Dimensionality of the embedding space.
    pub embedding_dim: usize,

    #[structopt(long)]
    /// Pretrained backbone weights to start from.
    pub initial_checkpoint: Option<PathBuf>,

    #[structopt(long, default_value = "32")]
    /// The number of identities in a batch.
    pub batch_p: usize,

    #[structopt(long, default_value = "4")]
    /// The number of images per identity in a batch.
    pub batch_k: usize,

    #[structopt(long, default_value = "256")]
    pub net_input_height: usize,

    #[structopt(long, default_value = "128")]
    pub net_input_width: usize,

    #[structopt(long, default_value = "288")]
    /// The height images are resized to before cropping with --crop-augment.
    pub pre_crop_height: usize,

    #[structopt(long, default_value = "144")]
    /// The width images are resized to before cropping with --crop-augment.
    pub pre_crop_width: usize,

    #[structopt(long, default_value = "8")]
    /// The number of concurrent image loading tasks.
    pub loading_threads: usize,

    #[structopt(long, default_value = "soft")]
    /// The margin of the triplet loss: 'soft', 'none' or a number.
    pub margin: Margin,

    #[structopt(long, default_value = "euclidean", possible_values = Metric::VARIANTS)]
    pub metric: Metric,

    #[structopt(long, default_value = "batch_hard", possible_values = LossKind::VARIANTS)]
    pub loss: LossKind,

    #[structopt(long, default_value = "3e-4")]
    pub learning_rate: f64,

    #[structopt(long, default_value = "25000")]
    pub train_iterations: usize,

    #[structopt(long, default_value = "15000", allow_hyphen_values = true)]
    /// The iteration to start the exponential learning rate decay. Negative disables the decay.
    pub decay_start_iteration: i64,

    #[structopt(long, default_value = "1000")]
    /// Save a checkpoint every this many iterations. Zero saves only at the end.
    pub checkpoint_frequency: usize,

    #[structopt(long)]
    /// Mirror images horizontally at random.
    pub flip_augment: bool,

    #[structopt(long)]
    /// Resize images to the pre-crop size and crop them randomly.
    pub crop_augment: bool,

    #[structopt(long)]
    /// Store embeddings, losses and file IDs of every step.
    pub detailed_logs: bool,

    #[structopt(long, default_value = "0")]
    /// The number of hard identities cached per identity. Zero disables hard identity mining.
    pub hard_pool_size: usize,

    #[structopt(long)]
    /// The .npz file with the 'emb' array of training embeddings, used to mine hard identities.
    pub train_embeddings: Option<PathBuf>,

    #[structopt(long)]
    /// Denoise and augment images. Takes precedence over --flip-augment and --crop-augment.
    pub augment: bool,

    #[structopt(long, default_value = "cuda_if_available", parse(try_from_str = parse_device))]
    /// 'cpu', 'cuda', 'cuda:N' or 'cuda_if_available'.
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,

    #[structopt(long)]
    /// The seed of batch sampling and augmentation.
    pub seed: Option<u64>,
}

impl Args {
    /// Check the value ranges of the arguments.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_p >= 2, "--batch-p must be at least 2");
        ensure!(self.batch_k >= 1, "--batch-k must be positive");
        ensure!(self.embedding_dim > 0, "--embedding-dim must be positive");
        ensure!(
            self.net_input_height > 0 && self.net_input_width > 0,
            "the network input size must be positive"
        );
        if self.crop_augment && !self.augment {
            ensure!(
                self.pre_crop_height >= self.net_input_height
                    && self.pre_crop_width >= self.net_input_width,
                "the pre-crop size must not be smaller than the network input size"
            );
        }
        ensure!(self.loading_threads > 0, "--loading-threads must be positive");
        ensure!(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            "--learning-rate must be positive"
        );
        if self.hard_pool_size > 0 {
            ensure!(
                self.train_embeddings.is_some(),
                "--hard-pool-size requires --train-embeddings"
            );
        }
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        self.batch_p * self.batch_k
    }

    /// The iteration to start the learning rate decay, if the decay is enabled.
    pub fn decay_start(&self) -> Option<usize> {
        (0..self.train_iterations as i64)
            .contains(&self.decay_start_iteration)
            .then(|| self.decay_start_iteration as usize)
    }

    pub fn image_loader_init(&self) -> ImageLoaderInit {
        ImageLoaderInit {
            net_input_size: [self.net_input_height, self.net_input_width],
            pre_crop_size: [self.pre_crop_height, self.pre_crop_width],
            flip_augment: self.flip_augment,
            crop_augment: self.crop_augment,
            denoise_augment: self.augment.then(DenoiseAugmentInit::default),
        }
    }

    pub fn model_init(&self) -> ReidModelInit {
        ReidModelInit {
            backbone: self.model_name,
            head: self.head_name,
            embedding_dim: self.embedding_dim,
        }
    }

    pub fn loss_init(&self) -> TripletLossInit {
        TripletLossInit {
            kind: self.loss,
            margin: self.margin,
            precision_at_k: self.batch_k.saturating_sub(1).max(1),
        }
    }
}

/// Parse 'cpu', 'cuda', 'cuda:N' or 'cuda_if_available'.
pub fn parse_device(text: &str) -> Result<Device> {
    let device = match text {
        "cpu" => Device::Cpu,
        "cuda" => Device::Cuda(0),
        "cuda_if_available" => Device::cuda_if_available(),
        text => {
            let index = text
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .ok_or_else(|| format_err!("invalid device '{}'", text))?;
            Device::Cuda(index)
        }
    };
    Ok(device)
}

/// The experiment directory with the effective run arguments.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub root: PathBuf,
    pub args: Args,
    /// Conflicts found while merging resumed arguments, to be logged once logging is ready.
    pub warnings: Vec<String>,
}

impl Experiment {
    /// Create a fresh experiment directory or resume an existing one.
    ///
    /// A fresh run requires the directory to be absent or empty and stores the arguments.
    /// A resumed run reads back the stored arguments, which win over the supplied ones.
    /// The effective arguments are validated in both cases.
    pub fn prepare(args: Args) -> Result<Self> {
        let root = args.experiment_root.clone();
        let args_file = root.join(ARGS_FILE_NAME);

        if args.resume {
            let text = fs::read_to_string(&args_file).with_context(|| {
                format!(
                    "cannot resume the experiment: failed to read {}",
                    args_file.display()
                )
            })?;
            let stored: Map<String, Value> = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", args_file.display()))?;
            let (args, warnings) = merge_resumed_args(&args, stored)?;
            args.validate()
                .context("the arguments of the resumed experiment are invalid")?;

            Ok(Self {
                root,
                args,
                warnings,
            })
        } else {
            args.validate()?;

            if root.exists() {
                let is_empty_dir = root.is_dir() && fs::read_dir(&root)?.next().is_none();
                ensure!(
                    is_empty_dir,
                    "The directory {} already exists and is not empty. \
                     If you want to resume training, append --resume to your call.",
                    root.display()
                );
            } else {
                fs::create_dir_all(&root)
                    .with_context(|| format!("failed to create {}", root.display()))?;
            }

            // keys are sorted since serde_json maps are ordered
            let text = serde_json::to_string_pretty(&serde_json::to_value(&args)?)?;
            fs::write(&args_file, text)
                .with_context(|| format!("failed to write {}", args_file.display()))?;

            Ok(Self {
                root,
                args,
                warnings: vec![],
            })
        }
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join(LOG_FILE_NAME)
    }

    pub fn event_dir(&self) -> PathBuf {
        self.root.join("events")
    }
}

/// Merge supplied arguments into the stored ones of a resumed experiment.
///
/// Stored values win over differing supplied values. Supplied arguments absent from the
/// stored ones are kept. Each case yields a warning message.
pub fn merge_resumed_args(
    supplied: &Args,
    stored: Map<String, Value>,
) -> Result<(Args, Vec<String>)> {
    let supplied = match serde_json::to_value(supplied)? {
        Value::Object(map) => map,
        _ => bail!("arguments must serialize to a JSON object"),
    };

    let mut warnings = vec![];
    let merged: Map<String, Value> = supplied
        .into_iter()
        .map(|(key, supplied_value)| {
            if RUNTIME_ONLY_ARGS.contains(&key.as_str()) {
                return (key, supplied_value);
            }

            let value = match stored.get(&key) {
                Some(stored_value) => {
                    if *stored_value != supplied_value {
                        warnings.push(format!(
                            "The resumed experiment sets {} to {}, ignoring the supplied value {}",
                            key, stored_value, supplied_value
                        ));
                    }
                    stored_value.clone()
                }
                None => {
                    warnings.push(format!(
                        "The argument {} is not found in the resumed experiment, using the supplied value {}",
                        key, supplied_value
                    ));
                    supplied_value
                }
            };
            (key, value)
        })
        .collect();

    let args: Args = serde_json::from_value(Value::Object(merged))
        .context("the stored arguments of the resumed experiment are malformed")?;
    Ok((args, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_devices() -> Result<()> {
        assert_eq!(parse_device("cpu")?, Device::Cpu);
        assert_eq!(parse_device("cuda")?, Device::Cuda(0));
        assert_eq!(parse_device("cuda:2")?, Device::Cuda(2));
        assert!(parse_device("gpu").is_err());
        assert!(parse_device("cuda:x").is_err());
        Ok(())
    }

    #[test]
    fn parse_command_line() -> Result<()> {
        let args = Args::from_iter_safe(&[
            "train",
            "--experiment-root",
            "exp",
            "--train-set",
            "train.csv",
            "--image-root",
            "images",
            "--margin",
            "0.2",
            "--loss",
            "lifted_structured",
            "--device",
            "cpu",
            "--flip-augment",
        ])?;

        assert_eq!(args.margin, Margin::Hard(r64(0.2)));
        assert_eq!(args.loss, LossKind::LiftedStructured);
        assert_eq!(args.model_name, BackboneKind::Resnet50);
        assert_eq!(args.head_name, HeadKind::Fc1024);
        assert_eq!(args.metric, Metric::Euclidean);
        assert_eq!(args.batch_size(), 128);
        assert_eq!(args.decay_start(), Some(15000));
        assert!(args.flip_augment && !args.crop_augment);
        args.validate()?;

        assert!(Args::from_iter_safe(&["train", "--train-set", "train.csv"]).is_err());
        Ok(())
    }

    #[test]
    fn parse_negative_decay_start() -> Result<()> {
        let args = Args::from_iter_safe(&[
            "train",
            "--experiment-root",
            "exp",
            "--decay-start-iteration",
            "-1",
        ])?;
        assert_eq!(args.decay_start_iteration, -1);
        assert_eq!(args.decay_start(), None);

        let args = Args::from_iter_safe(&[
            "train",
            "--experiment-root",
            "exp",
            "--decay-start-iteration=-5",
        ])?;
        assert_eq!(args.decay_start_iteration, -5);
        Ok(())
    }

    #[test]
    fn decay_start_range() -> Result<()> {
        let mut args = Args::from_iter_safe(&["train", "--experiment-root", "exp"])?;
        args.decay_start_iteration = -1;
        assert_eq!(args.decay_start(), None);
        args.decay_start_iteration = args.train_iterations as i64;
        assert_eq!(args.decay_start(), None);
        args.decay_start_iteration = 0;
        assert_eq!(args.decay_start(), Some(0));
        Ok(())
    }

    #[test]
    fn reject_invalid_args() -> Result<()> {
        let args = Args::from_iter_safe(&["train", "--experiment-root", "exp", "--batch-p", "1"])?;
        assert!(args.validate().is_err());

        let args = Args::from_iter_safe(&["train", "--experiment-root", "exp", "--hard-pool-size", "3"])?;
        assert!(args.validate().is_err());
        Ok(())
    }
}
