//! Data logging toolkit.

use crate::{common::*, utils::RateCounter};
use tokio::{fs::File as AsyncFile, io::BufWriter};

pub use detailed_logs::*;
pub use logging_message::*;
pub use logging_worker::*;

mod logging_worker {
    use super::*;

    /// The summary logging worker.
    #[derive(Debug)]
    pub struct LoggingWorker {
        precision_at_k: usize,
        event_writer: EventWriter<BufWriter<AsyncFile>>,
        rate_counter: RateCounter,
        rx: broadcast::Receiver<LoggingMessage>,
    }

    impl LoggingWorker {
        /// Create a summary logging worker writing under `event_dir`.
        async fn new(
            event_dir: &Path,
            precision_at_k: usize,
            rx: broadcast::Receiver<LoggingMessage>,
        ) -> Result<Self> {
            tokio::fs::create_dir_all(event_dir).await?;
            let event_path_prefix = event_dir
                .join("reid-dl")
                .into_os_string()
                .into_string()
                .map_err(|path| format_err!("non-UTF-8 event path {:?}", path))?;

            let event_writer = EventWriterInit::default()
                .from_prefix_async(event_path_prefix, None)
                .await?;

            Ok(Self {
                precision_at_k,
                event_writer,
                rate_counter: RateCounter::with_second_interval(),
                rx,
            })
        }

        /// Start the summary logging worker.
        async fn start(mut self) -> Result<()> {
            loop {
                let LoggingMessage { tag, kind } = match self.rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!("the logging worker dropped {} messages", count);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match kind {
                    LoggingMessageKind::TrainingStep(msg) => {
                        self.rate_counter.add(msg.batch_size() as f64);
                        self.log_training_step(&tag, msg).await?;
                    }
                }

                if let Some(rate) = self.rate_counter.rate() {
                    info!("processed {:.2} images/s", rate);
                }
            }

            self.event_writer.flush_async().await?;
            Ok(())
        }

        async fn log_training_step(&mut self, tag: &str, msg: TrainingStepLog) -> Result<()> {
            let precision_at_k = self.precision_at_k;
            let step = msg.step as i64;
            let lr = msg.lr.raw() as f32;
            let secs_per_iter = msg.secs_per_iter.raw() as f32;

            let (scalars, histograms) = tokio::task::spawn_blocking(move || -> Result<_> {
                tch::no_grad(|| -> Result<_> {
                    let TrainingStepLog {
                        embeddings,
                        dists,
                        losses,
                        ..
                    } = msg;
                    let batch_size = dists.size2()?.0;

                    let scalars = vec![
                        ("loss".to_string(), f32::from(losses.mean_loss())),
                        ("batch_top1".to_string(), losses.top1.double_value(&[]) as f32),
                        (
                            format!("batch_prec_at_{}", precision_at_k),
                            losses.precision_at_k.double_value(&[]) as f32,
                        ),
                        ("active_count".to_string(), losses.num_active() as f32),
                    ];

                    let upper = Tensor::ones(&[batch_size, batch_size], (Kind::Float, Device::Cpu))
                        .triu(1)
                        .to_kind(Kind::Bool)
                        .to_device(dists.device());
                    let histograms = vec![
                        ("loss_distribution", losses.losses.to_kind(Kind::Float)),
                        ("embedding_dists", dists.masked_select(&upper)),
                        ("embedding_pos_dists", losses.positive_dists.shallow_clone()),
                        ("embedding_neg_dists", losses.negative_dists.shallow_clone()),
                        (
                            "embedding_lengths",
                            embeddings.norm_scalaropt_dim(2, &[1], false),
                        ),
                    ];
                    let histograms: Vec<_> = histograms
                        .into_iter()
                        .map(|(name, values)| (name, values.to_device(Device::Cpu).view([-1])))
                        .collect();

                    Ok((scalars, histograms))
                })
            })
            .await??;

            for (name, value) in scalars {
                self.event_writer
                    .write_scalar_async(format!("{}/{}", tag, name), step, value)
                    .await?;
            }
            self.event_writer
                .write_scalar_async(format!("{}/learning_rate", tag), step, lr)
                .await?;
            self.event_writer
                .write_scalar_async(format!("{}/secs_per_iter", tag), step, secs_per_iter)
                .await?;

            for (name, values) in histograms {
                if values.numel() == 0 {
                    continue;
                }
                self.event_writer
                    .write_histogram_async(format!("{}/{}", tag, name), step, &values)
                    .await?;
            }

            Ok(())
        }
    }

    /// Spawn the summary logging worker and return a future to its completion.
    pub async fn logging_worker(
        event_dir: &Path,
        precision_at_k: usize,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<impl Future<Output = Result<()>> + Send> {
        let worker = LoggingWorker::new(event_dir, precision_at_k, rx).await?;
        Ok(tokio::task::spawn(worker.start()).map(|result| Fallible::Ok(result??)))
    }
}

mod logging_message {
    use super::*;

    /// The message type that is accepted by the logging worker.
    #[derive(Debug, TensorLike, Clone)]
    pub struct LoggingMessage {
        #[tensor_like(clone)]
        pub tag: Cow<'static, str>,
        pub kind: LoggingMessageKind,
    }

    impl LoggingMessage {
        pub fn new_training_step<S>(tag: S, msg: TrainingStepLog) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::TrainingStep(msg),
            }
        }
    }

    #[derive(Debug, TensorLike)]
    pub enum LoggingMessageKind {
        TrainingStep(TrainingStepLog),
    }

    impl Clone for LoggingMessageKind {
        fn clone(&self) -> Self {
            self.shallow_clone()
        }
    }

    /// Detached outputs of one training step.
    #[derive(Debug, TensorLike)]
    pub struct TrainingStepLog {
        pub step: usize,
        #[tensor_like(clone)]
        pub lr: R64,
        #[tensor_like(clone)]
        pub secs_per_iter: R64,
        /// Embeddings in `[B, D]` layout.
        pub embeddings: Tensor,
        /// Pairwise distances in `[B, B]` layout.
        pub dists: Tensor,
        pub losses: TripletLossOutput,
    }

    impl TrainingStepLog {
        pub fn batch_size(&self) -> usize {
            self.embeddings.size()[0] as usize
        }
    }

    impl Clone for TrainingStepLog {
        fn clone(&self) -> Self {
            self.shallow_clone()
        }
    }
}

mod detailed_logs {
    use super::*;

    const EMBEDDINGS_FILE_NAME: &str = "embeddings";
    const LOSSES_FILE_NAME: &str = "losses";
    const FIDS_FILE_NAME: &str = "fids";

    /// Per-step embeddings, losses and file IDs stored in fixed-shape little-endian files.
    ///
    /// Each file holds `train_iterations` rows, one per step. A row of `embeddings` is a
    /// `[B, D]` f32 array, a row of `losses` is a `[B]` f32 array and a row of `fids` is
    /// `B` zero-padded byte strings of `fid_len` bytes.
    #[derive(Debug)]
    pub struct DetailedLogs {
        batch_size: usize,
        embedding_dim: usize,
        fid_len: usize,
        embeddings: File,
        losses: File,
        fids: File,
    }

    impl DetailedLogs {
        /// Open the files under `dir`, keeping rows of earlier runs of a resumed experiment.
        pub fn open(
            dir: &Path,
            train_iterations: usize,
            batch_size: usize,
            embedding_dim: usize,
            fid_len: usize,
        ) -> Result<Self> {
            fs::create_dir_all(dir)?;
            let open = |name: &str, row_bytes: usize| -> Result<File> {
                let path = dir.join(name);
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                let len = (train_iterations * row_bytes) as u64;
                if file.metadata()?.len() < len {
                    file.set_len(len)?;
                }
                Ok(file)
            };

            Ok(Self {
                batch_size,
                embedding_dim,
                fid_len,
                embeddings: open(EMBEDDINGS_FILE_NAME, batch_size * embedding_dim * 4)?,
                losses: open(LOSSES_FILE_NAME, batch_size * 4)?,
                fids: open(FIDS_FILE_NAME, batch_size * fid_len)?,
            })
        }

        /// Write the row of `step`.
        pub fn write(
            &mut self,
            step: usize,
            embeddings: &Tensor,
            losses: &Tensor,
            fids: &[String],
        ) -> Result<()> {
            let Self {
                batch_size,
                embedding_dim,
                fid_len,
                ..
            } = *self;
            ensure!(
                embeddings.size() == [batch_size as i64, embedding_dim as i64],
                "expect embeddings of shape [{}, {}], but get {:?}",
                batch_size,
                embedding_dim,
                embeddings.size()
            );
            ensure!(
                losses.size() == [batch_size as i64] && fids.len() == batch_size,
                "expect {} losses and file IDs",
                batch_size
            );

            let embeddings: Vec<f32> = Vec::from(
                &embeddings
                    .detach()
                    .to_device(Device::Cpu)
                    .to_kind(Kind::Float)
                    .view([-1]),
            );
            let losses: Vec<f32> =
                Vec::from(&losses.detach().to_device(Device::Cpu).to_kind(Kind::Float));

            let mut buf = Vec::with_capacity(embeddings.len() * 4);
            for value in embeddings {
                buf.write_f32::<LittleEndian>(value)?;
            }
            write_row(&mut self.embeddings, step, &buf)?;

            buf.clear();
            for value in losses {
                buf.write_f32::<LittleEndian>(value)?;
            }
            write_row(&mut self.losses, step, &buf)?;

            buf.clear();
            for fid in fids {
                let bytes = fid.as_bytes();
                ensure!(
                    bytes.len() <= fid_len,
                    "the file ID '{}' exceeds {} bytes",
                    fid,
                    fid_len
                );
                buf.extend_from_slice(bytes);
                buf.resize(buf.len() + fid_len - bytes.len(), 0);
            }
            write_row(&mut self.fids, step, &buf)?;

            Ok(())
        }
    }

    fn write_row(file: &mut File, step: usize, row: &[u8]) -> Result<()> {
        file.seek(SeekFrom::Start((step * row.len()) as u64))?;
        file.write_all(row)?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use byteorder::ReadBytesExt;
        use std::io::Read;

        #[test]
        fn write_rows_at_step_offsets() -> Result<()> {
            let dir = std::env::temp_dir().join(format!("detailed-logs-{}", uuid::Uuid::new_v4()));
            let mut logs = DetailedLogs::open(&dir, 3, 2, 2, 8)?;

            assert_eq!(fs::metadata(dir.join(EMBEDDINGS_FILE_NAME))?.len(), 3 * 2 * 2 * 4);
            assert_eq!(fs::metadata(dir.join(LOSSES_FILE_NAME))?.len(), 3 * 2 * 4);
            assert_eq!(fs::metadata(dir.join(FIDS_FILE_NAME))?.len(), 3 * 2 * 8);

            let embeddings = Tensor::of_slice(&[1f32, 2.0, 3.0, 4.0]).view([2, 2]);
            let losses = Tensor::of_slice(&[0.5f32, 0.25]);
            let fids = vec!["a/1.jpg".to_string(), "b/2.jpg".to_string()];
            logs.write(1, &embeddings, &losses, &fids)?;

            let mut file = File::open(dir.join(LOSSES_FILE_NAME))?;
            file.seek(SeekFrom::Start(2 * 4))?;
            assert_eq!(file.read_f32::<LittleEndian>()?, 0.5);
            assert_eq!(file.read_f32::<LittleEndian>()?, 0.25);

            let mut file = File::open(dir.join(EMBEDDINGS_FILE_NAME))?;
            file.seek(SeekFrom::Start(2 * 2 * 4 + 3 * 4))?;
            assert_eq!(file.read_f32::<LittleEndian>()?, 4.0);

            let mut bytes = vec![];
            File::open(dir.join(FIDS_FILE_NAME))?.read_to_end(&mut bytes)?;
            assert_eq!(&bytes[16..24], b"a/1.jpg\0");
            assert_eq!(&bytes[24..32], b"b/2.jpg\0");
            assert!(bytes[..16].iter().all(|&byte| byte == 0));

            let long_fids = vec!["a/very/long/name.jpg".to_string(), "b".to_string()];
            assert!(logs.write(0, &embeddings, &losses, &long_fids).is_err());

            fs::remove_dir_all(&dir)?;
            Ok(())
        }
    }
}
