use crate::common::*;

/// Set the returned flag once the process receives Ctrl-C or SIGTERM.
///
/// The training worker checks the flag between steps and stops after saving a checkpoint.
pub fn interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));

    tokio::spawn({
        let flag = flag.clone();
        async move {
            if let Err(err) = wait_for_interrupt().await {
                error!("failed to listen for signals: {:?}", err);
                return;
            }
            warn!("interrupted, stopping after the current step");
            flag.store(true, Ordering::SeqCst);
        }
    });

    flag
}

#[cfg(unix)]
async fn wait_for_interrupt() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_interrupt() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
