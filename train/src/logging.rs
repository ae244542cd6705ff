//! Data logging toolkit.

use crate::common::*;
use async_std::{fs::File, io::BufWriter};
use tokio::io::AsyncWriteExt as _;

pub use logging_message::*;
pub use logging_worker::*;

mod logging_worker {
    use super::*;

    /// Writes scalars to TensorBoard event files and text lines to the
    /// training log file.
    #[derive(Debug)]
    pub struct LoggingWorker {
        event_writer: EventWriter<BufWriter<File>>,
        text_log: tokio::fs::File,
        rx: broadcast::Receiver<LoggingMessage>,
    }

    impl LoggingWorker {
        /// Create a data logging worker.
        async fn new(
            event_prefix: &Path,
            text_log_path: &Path,
            rx: broadcast::Receiver<LoggingMessage>,
        ) -> Result<Self> {
            if let Some(event_dir) = event_prefix.parent() {
                tokio::fs::create_dir_all(event_dir).await?;
            }
            let event_prefix = event_prefix
                .to_str()
                .ok_or_else(|| format_err!("non-UTF-8 path '{}'", event_prefix.display()))?
                .to_owned();
            let event_writer = EventWriterInit::default()
                .from_prefix_async(event_prefix, None)
                .await?;

            let text_log = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(text_log_path)
                .await
                .with_context(|| format!("failed to open '{}'", text_log_path.display()))?;

            Ok(Self {
                event_writer,
                text_log,
                rx,
            })
        }

        /// Start the data logging worker.
        async fn start(mut self) -> Result<()> {
            loop {
                let LoggingMessage { tag, kind } = match self.rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("logging worker lagged behind, {} messages are dropped", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match kind {
                    LoggingMessageKind::Scalar { step, value } => {
                        self.event_writer
                            .write_scalar_async(tag.to_string(), step, value)
                            .await?;
                    }
                    LoggingMessageKind::Text { line } => {
                        let line = format!("{} {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), line);
                        self.text_log.write_all(line.as_bytes()).await?;
                        self.text_log.flush().await?;
                    }
                }
            }

            Ok(())
        }
    }

    /// Runs the logging worker until every sender is dropped.
    pub async fn logging_worker(
        event_prefix: PathBuf,
        text_log_path: PathBuf,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<()> {
        LoggingWorker::new(&event_prefix, &text_log_path, rx)
            .await?
            .start()
            .await?;
        Ok(())
    }
}

mod logging_message {
    use super::*;

    /// The message type that is accepted by the logging worker.
    #[derive(Debug, Clone)]
    pub struct LoggingMessage {
        pub tag: Cow<'static, str>,
        pub kind: LoggingMessageKind,
    }

    impl LoggingMessage {
        pub fn new_scalar<S>(tag: S, step: usize, value: f64) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::Scalar {
                    step: step as i64,
                    value: value as f32,
                },
            }
        }

        pub fn new_text<S>(line: S) -> Self
        where
            S: Into<String>,
        {
            Self {
                tag: "train_log".into(),
                kind: LoggingMessageKind::Text { line: line.into() },
            }
        }
    }

    #[derive(Debug, Clone)]
    pub enum LoggingMessageKind {
        Scalar { step: i64, value: f32 },
        Text { line: String },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_lines_are_appended() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("train-logging-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await?;
        let text_log_path = dir.join("net_train.log");
        if text_log_path.exists() {
            tokio::fs::remove_file(&text_log_path).await?;
        }

        let (tx, rx) = broadcast::channel(8);
        let worker = tokio::spawn(logging_worker(
            dir.join("tb").join("net"),
            text_log_path.clone(),
            rx,
        ));

        tx.send(LoggingMessage::new_text("[Epoch 0] Training cost: 1.000"))
            .map_err(|_| format_err!("cannot send message to logger"))?;
        tx.send(LoggingMessage::new_scalar("Training_ObjLoss", 3, 0.5))
            .map_err(|_| format_err!("cannot send message to logger"))?;
        drop(tx);
        worker.await??;

        let text = tokio::fs::read_to_string(&text_log_path).await?;
        assert_eq!(text.lines().count(), 1);
        assert!(text.trim_end().ends_with("[Epoch 0] Training cost: 1.000"));
        assert!(dir.join("tb").exists());
        Ok(())
    }
}
