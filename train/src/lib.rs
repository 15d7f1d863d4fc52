//! The training program for the reid-dl project.

pub mod common;
pub mod config;
pub mod logging;
pub mod train;
pub mod training_stream;
pub mod utils;

use crate::{common::*, config::Experiment, training_stream::TrainingStream};

/// The number of batches buffered between the loaders and the training worker.
const DATA_CHANNEL_SIZE: usize = 2;
const LOGGING_CHANNEL_SIZE: usize = 16;

/// The entry of training program.
pub async fn start(experiment: Arc<Experiment>) -> Result<()> {
    let args = &experiment.args;
    let (train_set, image_root) = match (&args.train_set, &args.image_root) {
        (Some(train_set), Some(image_root)) => (train_set.clone(), image_root.clone()),
        _ => {
            let _ = config::Args::clap().print_help();
            println!();
            error!("You did not specify the required `train_set` and `image_root` arguments!");
            bail!("missing the required --train-set and --image-root arguments");
        }
    };

    // load dataset
    info!("loading dataset {}", train_set.display());
    let dataset = Arc::new(
        tokio::task::spawn_blocking(move || ReidDataset::load(&train_set, &image_root, true))
            .await??,
    );
    info!(
        "loaded {} images of {} identities",
        dataset.len(),
        dataset.num_identities()
    );

    // mine hard identities
    let hard_pool = if args.hard_pool_size > 0 {
        let path = args
            .train_embeddings
            .clone()
            .ok_or_else(|| format_err!("--hard-pool-size requires --train-embeddings"))?;
        let pool_size = args.hard_pool_size;
        let dataset = dataset.clone();
        info!("building hard identity pools from {}", path.display());
        let pool = tokio::task::spawn_blocking(move || {
            HardIdentityPool::from_npz(&dataset, &path, pool_size)
        })
        .await??;
        Some(Arc::new(pool))
    } else {
        None
    };

    // create channels
    let (logging_tx, logging_rx) = broadcast::channel(LOGGING_CHANNEL_SIZE);
    let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_SIZE);

    // start logger
    let logging_future = logging::logging_worker(
        &experiment.event_dir(),
        args.loss_init().precision_at_k,
        logging_rx,
    )
    .await?;

    // feeding worker
    let start_step = match utils::latest_checkpoint(&experiment.root)? {
        Some((_path, step)) if args.resume => step,
        _ => 0,
    };
    let fid_len = dataset.max_fid_len();
    let training_stream = TrainingStream::new(args, dataset, hard_pool)?;
    let feeder = tokio::task::spawn(async move {
        let mut train_stream = training_stream.train_stream(start_step);

        while let Some(result) = train_stream.next().await {
            let record = result?;
            if data_tx.send(record).await.is_err() {
                // the training worker has stopped
                break;
            }
        }

        Fallible::Ok(())
    });

    // training worker
    let interrupted = utils::interrupt_flag();
    let training_result = {
        let experiment = experiment.clone();
        let logging_tx = logging_tx.clone();
        tokio::task::spawn_blocking(move || {
            train::training_worker(experiment, fid_len, data_rx, logging_tx, interrupted)
        })
        .instrument(info_span!("training_worker"))
        .await
    };

    // a loading error closes the channel and fails the worker, so report it first
    feeder.abort();
    if let Ok(result) = feeder.await {
        result?;
    }
    training_result??;

    drop(logging_tx);
    logging_future.await?;

    Ok(())
}
