//! The stream of training batches.

use crate::{common::*, config::Args};
use reid_dl::dataset::BatchSample;

/// A batch of loaded images with identity labels.
#[derive(Debug, TensorLike)]
pub struct TrainingRecord {
    pub epoch: usize,
    pub step: usize,
    /// Images in `[B, 3, H, W]` float layout in `[0, 1]`.
    pub images: Tensor,
    /// Identity indexes in `[B]` int64 layout.
    pub pids: Tensor,
    #[tensor_like(clone)]
    pub fids: Vec<String>,
}

/// Loads PK batches of images concurrently.
#[derive(Debug)]
pub struct TrainingStream {
    dataset: Arc<ReidDataset>,
    sampler: PkSampler,
    loader: Arc<ImageLoader>,
    loading_threads: usize,
    rng: StdRng,
}

impl TrainingStream {
    pub fn new(
        args: &Args,
        dataset: Arc<ReidDataset>,
        hard_pool: Option<Arc<HardIdentityPool>>,
    ) -> Result<Self> {
        let mut rng = match args.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let sampler = PkSamplerInit {
            batch_p: args.batch_p,
            batch_k: args.batch_k,
            hard_pool,
        }
        .build(dataset.clone(), StdRng::from_rng(&mut rng)?)?;
        let loader = Arc::new(args.image_loader_init().build()?);

        Ok(Self {
            dataset,
            sampler,
            loader,
            loading_threads: args.loading_threads,
            rng,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.sampler.batch_size()
    }

    /// Produce an endless stream of batches numbered from `start_step`.
    pub fn train_stream(
        self,
        start_step: usize,
    ) -> Pin<Box<dyn Stream<Item = Result<TrainingRecord>> + Send>> {
        let Self {
            dataset,
            sampler,
            loader,
            loading_threads,
            mut rng,
        } = self;
        let batch_size = sampler.batch_size();

        // load images concurrently
        let image_stream = stream::iter(sampler)
            .flat_map(|batch| {
                let PkBatch { epoch, samples } = batch;
                stream::iter(samples.into_iter().map(move |sample| (epoch, sample)))
            })
            .map(move |(epoch, sample)| {
                let dataset = dataset.clone();
                let loader = loader.clone();
                let seed: u64 = rng.gen();

                async move {
                    let BatchSample { identity, record } = sample;
                    let image = tokio::task::spawn_blocking(move || {
                        let path = dataset.image_path(record);
                        let mut rng = StdRng::seed_from_u64(seed);
                        let image = loader
                            .load(&path, &mut rng)
                            .with_context(|| format!("failed to load {}", path.display()))?;
                        let fid = dataset.samples()[record].fid.clone();
                        Fallible::Ok((image, fid))
                    })
                    .await??;
                    Fallible::Ok((epoch, identity, image))
                }
            })
            .buffered(loading_threads);

        // group images into batches
        let stream = image_stream
            .chunks(batch_size)
            .enumerate()
            .map(move |(index, results)| -> Result<_> {
                let samples: Vec<_> = results.into_iter().try_collect()?;
                ensure!(samples.len() == batch_size, "the sampler stopped unexpectedly");

                let epoch = samples.iter().map(|(epoch, ..)| *epoch).max().unwrap_or(0);
                let mut images = Vec::with_capacity(batch_size);
                let mut pids = Vec::with_capacity(batch_size);
                let mut fids = Vec::with_capacity(batch_size);
                for (_epoch, identity, (image, fid)) in samples {
                    images.push(image);
                    pids.push(identity as i64);
                    fids.push(fid);
                }

                Ok(TrainingRecord {
                    epoch,
                    step: start_step + index,
                    images: Tensor::stack(&images, 0),
                    pids: Tensor::of_slice(&pids),
                    fids,
                })
            });

        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reid_dl::dataset::CsvSample;

    #[tokio::test]
    async fn load_pk_batches() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("stream-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir)?;

        let mut samples = vec![];
        for pid in 0..3 {
            for index in 0..2 {
                let fid = format!("{}_{}.png", pid, index);
                let image = Tensor::rand(&[3, 20, 10], (Kind::Float, Device::Cpu)) * 255.0;
                tch::vision::image::save(&image.to_kind(Kind::Uint8), dir.join(&fid))?;
                samples.push(CsvSample {
                    pid: pid.to_string(),
                    fid,
                });
            }
        }
        let dataset = Arc::new(ReidDataset::from_samples(&dir, samples)?);

        let args = Args::from_iter_safe(&[
            "train",
            "--experiment-root",
            "exp",
            "--batch-p",
            "2",
            "--batch-k",
            "2",
            "--net-input-height",
            "16",
            "--net-input-width",
            "8",
            "--loading-threads",
            "2",
            "--seed",
            "7",
        ])?;

        let stream = TrainingStream::new(&args, dataset, None)?;
        assert_eq!(stream.batch_size(), 4);
        let records: Vec<_> = stream.train_stream(10).take(3).try_collect().await?;

        for (index, record) in records.iter().enumerate() {
            assert_eq!(record.step, 10 + index);
            assert_eq!(record.images.size(), vec![4, 3, 16, 8]);
            assert_eq!(record.fids.len(), 4);

            let pids: Vec<i64> = Vec::from(&record.pids);
            assert_eq!(pids[0], pids[1]);
            assert_eq!(pids[2], pids[3]);
            assert_ne!(pids[0], pids[2]);
        }

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
