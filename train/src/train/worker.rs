use crate::{
    common::*,
    config::Experiment,
    logging::{DetailedLogs, LoggingMessage, TrainingStepLog},
    training_stream::TrainingRecord,
    utils::{self, LrScheduler},
};

const GLOBAL_STEP_VAR: &str = "global_step";

/// Trainable variables together with the persisted step counter.
#[derive(Debug)]
pub struct TrainingState {
    pub vs: nn::VarStore,
    pub model: ReidModel,
    global_step: Tensor,
}

impl TrainingState {
    pub fn new(experiment: &Experiment, device: Device) -> Result<Self> {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let model = experiment.args.model_init().build(&root)?;
        let global_step = root.zeros_no_train(GLOBAL_STEP_VAR, &[]);

        Ok(Self {
            vs,
            model,
            global_step,
        })
    }

    pub fn global_step(&self) -> usize {
        self.global_step.double_value(&[]) as usize
    }

    pub fn set_global_step(&mut self, step: usize) {
        tch::no_grad(|| {
            self.global_step.copy_(&Tensor::from(step as f32))
        });
    }

    /// Restore the latest checkpoint of a resumed experiment, or initialize a fresh one.
    ///
    /// A fresh run loads the pretrained weights if given and saves the step 0 checkpoint.
    /// Returns the step to continue from.
    pub fn restore(&mut self, experiment: &Experiment) -> Result<usize> {
        let Experiment { root, args, .. } = experiment;

        if args.resume {
            let (path, file_step) = utils::latest_checkpoint(root)?.ok_or_else(|| {
                format_err!("no checkpoint found in {} to resume from", root.display())
            })?;
            info!("restoring checkpoint {}", path.display());
            self.vs
                .load(&path)
                .with_context(|| format!("failed to load checkpoint {}", path.display()))?;

            let step = self.global_step();
            if step != file_step {
                warn!(
                    "the checkpoint {} stores step {}, continuing from the stored step",
                    path.display(),
                    step
                );
            }
            Ok(step)
        } else {
            if let Some(path) = &args.initial_checkpoint {
                info!("loading initial weights from {}", path.display());
                let missing = self
                    .vs
                    .load_partial(path)
                    .with_context(|| format!("failed to load weights {}", path.display()))?;
                if !missing.is_empty() {
                    info!("{} variables are not in the initial weights", missing.len());
                }
            }
            self.set_global_step(0);
            utils::save_checkpoint(&self.vs, root, 0)?;
            Ok(0)
        }
    }

    pub fn save(&self, experiment_dir: &Path) -> Result<PathBuf> {
        let step = self.global_step();
        let path = utils::save_checkpoint(&self.vs, experiment_dir, step)?;
        info!("saved checkpoint {}", path.display());
        Ok(path)
    }
}

/// Start the single-device training worker.
///
/// Runs on a blocking thread until `train_iterations` steps are done or `interrupted` is
/// set, then saves the final checkpoint. A data stream that ends early is an error.
pub fn training_worker(
    experiment: Arc<Experiment>,
    fid_len: usize,
    mut data_rx: mpsc::Receiver<TrainingRecord>,
    logging_tx: broadcast::Sender<LoggingMessage>,
    interrupted: Arc<AtomicBool>,
) -> Result<()> {
    let args = &experiment.args;
    let device = args.device;
    info!("use device {:?}", device);

    // init model
    info!("initializing model");
    let mut state = TrainingState::new(&experiment, device)?;
    let loss_fn = args.loss_init().build()?;
    let metric = args.metric;
    let lr_scheduler = LrScheduler::new(
        args.learning_rate,
        args.decay_start(),
        args.train_iterations,
    )?;
    let mut optimizer = nn::Adam::default().build(&state.vs, args.learning_rate)?;

    let start_step = state.restore(&experiment)?;
    if start_step >= args.train_iterations {
        info!(
            "the experiment already completed {} iterations",
            args.train_iterations
        );
        return Ok(());
    }

    let mut detailed_logs = args
        .detailed_logs
        .then(|| {
            DetailedLogs::open(
                &experiment.root.join("detailed_logs"),
                args.train_iterations,
                args.batch_size(),
                args.embedding_dim,
                fid_len,
            )
        })
        .transpose()?;

    info!("start training from step {}", start_step);
    let mut step = start_step;

    while step < args.train_iterations {
        let instant = Instant::now();
        let record = match data_rx.blocking_recv() {
            Some(record) => record,
            None => bail!("the data stream ended unexpectedly"),
        };
        let TrainingRecord {
            epoch,
            images,
            pids,
            fids,
            ..
        } = record.to_device(device);

        let lr = lr_scheduler.lr(step);
        optimizer.set_lr(lr);

        // forward pass
        let HeadOutput { emb, .. } = state.model.forward_t(&images, true)?;
        let dists = metric.pairwise(&emb)?;
        let losses = loss_fn.forward(&dists, &pids)?;
        let mean_loss = losses.mean_loss();

        // optimize
        optimizer.backward_step(&mean_loss);
        step += 1;
        state.set_global_step(step);

        let secs_per_iter = instant.elapsed().as_secs_f64();
        let (loss_min, loss_avg, loss_max) = tch::no_grad(|| {
            (
                f32::from(losses.losses.min()),
                f32::from(&mean_loss),
                f32::from(losses.losses.max()),
            )
        });
        info!(
            "epoch: {}\tstep: {}\tloss: {:7.3}|{:7.3}|{:7.3}\tbatch-p@{}: {:.2}%\tETA: {}\t({:.3}s/it)",
            epoch,
            step,
            loss_min,
            loss_avg,
            loss_max,
            loss_fn.precision_at_k(),
            losses.precision_at_k.double_value(&[]) * 100.0,
            utils::format_eta(secs_per_iter, args.train_iterations - step),
            secs_per_iter,
        );

        if let Some(detailed_logs) = &mut detailed_logs {
            detailed_logs.write(step - 1, &emb, &losses.losses, &fids)?;
        }

        // send to logger
        let log = TrainingStepLog {
            step,
            lr: r64(lr),
            secs_per_iter: r64(secs_per_iter),
            embeddings: emb.detach(),
            dists: dists.detach(),
            losses: losses.detach(),
        };
        if logging_tx
            .send(LoggingMessage::new_training_step("train", log))
            .is_err()
        {
            warn!("the logging worker is gone, summaries are not recorded");
        }

        // save checkpoint
        let is_last = step == args.train_iterations;
        if !is_last && args.checkpoint_frequency > 0 && step % args.checkpoint_frequency == 0 {
            state.save(&experiment.root)?;
        }

        if interrupted.load(Ordering::SeqCst) {
            info!("stopping training at step {}", step);
            break;
        }
    }

    state.save(&experiment.root)?;
    info!("training finished at step {}", step);

    Ok(())
}
