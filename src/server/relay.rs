//! Moves encoded chunks from a transcoder session to the HTTP response body.
//!
//! The body is fed through a channel of capacity [`SINK_CAPACITY`], so a slow client
//! parks the relay in `send`, which stops reads from the transcoder, which fills its
//! stdin pipe, which parks the engine worker.

use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::transcode::{EncodedChunk, TranscoderSession};

/// Chunks buffered between the relay and the response body.
pub const SINK_CAPACITY: usize = 1;

/// Relay side of the response body.
#[derive(Debug)]
pub struct BodySender {
    tx: mpsc::Sender<Bytes>,
    aborted: CancellationToken,
}

impl BodySender {
    /// Mark the body as failed; the receiver reports an error instead of a clean end.
    ///
    /// Never blocks, so it works while the client has stopped reading.
    fn abort(self) {
        self.aborted.cancel();
    }
}

/// Response side of the body channel.
#[derive(Debug)]
pub struct BodyReceiver {
    rx: mpsc::Receiver<Bytes>,
    aborted: CancellationToken,
    finished: bool,
}

impl BodyReceiver {
    /// Next body item: buffered chunks first, then a single `Err` if the relay aborted.
    pub async fn recv(&mut self) -> Option<Result<Bytes, io::Error>> {
        if self.finished {
            return None;
        }

        match self.rx.recv().await {
            Some(chunk) => Some(Ok(chunk)),
            None => {
                self.finished = true;
                self.aborted.is_cancelled().then(|| Err(io::Error::other("audio stream aborted")))
            }
        }
    }
}

/// Bounded body channel between a relay and its response.
pub fn body_channel(capacity: usize) -> (BodySender, BodyReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let aborted = CancellationToken::new();
    (BodySender { tx, aborted: aborted.clone() }, BodyReceiver { rx, aborted, finished: false })
}

/// How a relay ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Completed { bytes: u64 },
    ClientDisconnected { bytes: u64 },
    Failed { bytes: u64, error: PipelineError },
}

impl RelayOutcome {
    pub fn log(&self, voice: &str) {
        match self {
            RelayOutcome::Completed { bytes } => info!("✅ Streamed {} bytes of '{}' audio", bytes, voice),
            RelayOutcome::ClientDisconnected { bytes } => info!("🔌 Client disconnected after {} bytes of '{}' audio", bytes, voice),
            RelayOutcome::Failed { bytes, error } => warn!("❌ Stream of '{}' aborted after {} bytes: {}", voice, bytes, error),
        }
    }
}

/// Forward `first` and every following chunk of `session` into `sink`.
///
/// Server shutdown and the request deadline end the relay even while the client has
/// stopped reading. The session is dropped before returning, which kills and reaps its process.
///
/// # Arguments
/// * `session` - Transcoder session owned by this response
/// * `first` - Chunk already taken from the session before the status line was sent
/// * `sink` - Response body channel
pub async fn relay(mut session: TranscoderSession, first: Option<EncodedChunk>, sink: BodySender) -> RelayOutcome {
    let interruption = session.interruption();
    let mut bytes = 0u64;
    let mut pending = first;

    let outcome = loop {
        let next = match pending.take() {
            Some(chunk) => Some(Ok(chunk)),
            None => tokio::select! {
                _ = sink.tx.closed() => break RelayOutcome::ClientDisconnected { bytes },
                error = interruption.wait() => Some(Err(error)),
                next = session.next_chunk() => next,
            },
        };

        match next {
            None => break RelayOutcome::Completed { bytes },
            Some(Ok(chunk)) => {
                let len = chunk.len() as u64;
                let sent = tokio::select! {
                    error = interruption.wait() => break RelayOutcome::Failed { bytes, error },
                    sent = sink.tx.send(chunk) => sent,
                };
                if sent.is_err() {
                    break RelayOutcome::ClientDisconnected { bytes };
                }
                bytes += len;
            }
            Some(Err(PipelineError::ClientDisconnect)) => break RelayOutcome::ClientDisconnected { bytes },
            Some(Err(error)) => break RelayOutcome::Failed { bytes, error },
        }
    };

    // Headers are already out; failing the body is the only signal left.
    if matches!(outcome, RelayOutcome::Failed { .. }) {
        sink.abort();
    }
    drop(session);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use crate::transcode::{SessionOptions, Transcoder, TranscoderCommand};
    use crate::tts::testing::ToneEngine;
    use crate::tts::{InvokerOptions, PcmStream, SynthesisParams, VoiceModel, synthesize};

    fn cat() -> Transcoder {
        Transcoder::new(TranscoderCommand::new("cat", Vec::<String>::new()), SessionOptions::default())
    }

    fn pcm_from(items: Vec<Result<Bytes, PipelineError>>) -> PcmStream {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.try_send(item).unwrap();
        }
        PcmStream::from_receiver(rx)
    }

    async fn wait_until_reaped(transcoder: &Transcoder) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while transcoder.stats().active() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("transcoder was not reaped in time");
    }

    #[tokio::test]
    async fn test_relay_completes_in_order() {
        let transcoder = cat();
        let program = transcoder.preflight().unwrap();
        let pcm = pcm_from(vec![Ok(Bytes::from_static(b"one")), Ok(Bytes::from_static(b"two"))]);
        let session = transcoder.open(&program, pcm, CancellationToken::new()).unwrap();

        let (sink, mut body) = body_channel(8);
        let outcome = relay(session, None, sink).await;

        let mut received = Vec::new();
        while let Some(item) = body.recv().await {
            received.extend_from_slice(&item.unwrap());
        }
        assert_eq!(received, b"onetwo");
        assert_eq!(outcome, RelayOutcome::Completed { bytes: 6 });
        wait_until_reaped(&transcoder).await;
    }

    #[tokio::test]
    async fn test_relay_fails_body_on_upstream_error() {
        let transcoder = cat();
        let program = transcoder.preflight().unwrap();
        let pcm = pcm_from(vec![Ok(Bytes::from_static(b"partial")), Err(PipelineError::Synthesis("engine crashed".to_string()))]);
        let session = transcoder.open(&program, pcm, CancellationToken::new()).unwrap();

        let (sink, mut body) = body_channel(8);
        let outcome = relay(session, None, sink).await;

        assert!(matches!(outcome, RelayOutcome::Failed { error: PipelineError::Synthesis(_), .. }));
        let mut saw_error = false;
        while let Some(item) = body.recv().await {
            saw_error |= item.is_err();
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_pipeline() {
        let transcoder = cat();
        let program = transcoder.preflight().unwrap();
        let (pcm_tx, pcm_rx) = mpsc::channel(1);
        let session = transcoder.open(&program, PcmStream::from_receiver(pcm_rx), CancellationToken::new()).unwrap();

        // Endless PCM producer
        let producer = tokio::spawn(async move {
            while pcm_tx.send(Ok(Bytes::from(vec![0u8; 4096]))).await.is_ok() {}
        });

        let (sink, mut body) = body_channel(SINK_CAPACITY);
        let relay_task = tokio::spawn(relay(session, None, sink));

        assert!(body.recv().await.unwrap().is_ok());
        drop(body);

        let outcome = tokio::time::timeout(Duration::from_secs(5), relay_task).await.unwrap().unwrap();
        assert!(matches!(outcome, RelayOutcome::ClientDisconnected { .. }));

        wait_until_reaped(&transcoder).await;
        tokio::time::timeout(Duration::from_secs(5), producer).await.unwrap().unwrap();
    }

    /// Open a `cat` session fed by an endless PCM producer.
    fn endless_session(transcoder: &Transcoder, shutdown: CancellationToken) -> TranscoderSession {
        let program = transcoder.preflight().unwrap();
        let (pcm_tx, pcm_rx) = mpsc::channel(1);
        tokio::spawn(async move { while pcm_tx.send(Ok(Bytes::from(vec![0u8; 4096]))).await.is_ok() {} });
        transcoder.open(&program, PcmStream::from_receiver(pcm_rx), shutdown).unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_ends_relay_with_stalled_client() {
        let transcoder = cat();
        let shutdown = CancellationToken::new();
        let session = endless_session(&transcoder, shutdown.clone());

        // Body is never read until the relay has finished.
        let (sink, mut body) = body_channel(SINK_CAPACITY);
        let relay_task = tokio::spawn(relay(session, None, sink));

        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), relay_task).await.expect("relay ignored shutdown").unwrap();
        assert!(matches!(outcome, RelayOutcome::Failed { error: PipelineError::Cancelled(_), .. }));
        wait_until_reaped(&transcoder).await;

        assert!(body.recv().await.unwrap().is_ok());
        assert!(body.recv().await.unwrap().is_err(), "aborted body must not end cleanly");
        assert!(body.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_deadline_ends_relay_with_stalled_client() {
        let options = SessionOptions { timeout: Some(Duration::from_millis(500)), ..Default::default() };
        let transcoder = Transcoder::new(TranscoderCommand::new("cat", Vec::<String>::new()), options);
        let session = endless_session(&transcoder, CancellationToken::new());

        let (sink, body) = body_channel(SINK_CAPACITY);
        let relay_task = tokio::spawn(relay(session, None, sink));

        let outcome = tokio::time::timeout(Duration::from_secs(5), relay_task).await.expect("relay ignored deadline").unwrap();
        assert!(matches!(outcome, RelayOutcome::Failed { error: PipelineError::Cancelled(ref reason), .. } if reason == "request timed out"));
        wait_until_reaped(&transcoder).await;
        drop(body);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_client_stops_synthesis() {
        let engine = ToneEngine::new(48000, 48000);
        let calls = engine.calls.clone();
        let voice = Arc::new(VoiceModel::new("tone", "tone.onnx", Box::new(engine)));
        let sentences = 200;
        let text = "Go. ".repeat(sentences);

        let pcm = synthesize(voice, &text, SynthesisParams::default(), InvokerOptions::default()).unwrap();
        let transcoder = cat();
        let program = transcoder.preflight().unwrap();
        let session = transcoder.open(&program, pcm, CancellationToken::new()).unwrap();

        // The body channel is never read: every buffer in the pipeline fills up.
        let (sink, body) = body_channel(SINK_CAPACITY);
        let relay_task = tokio::spawn(relay(session, None, sink));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let settled = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(calls.load(Ordering::SeqCst), settled, "engine kept running with a stalled client");
        assert!(settled < sentences / 4, "engine ran {} of {} sentences", settled, sentences);

        drop(body);
        tokio::time::timeout(Duration::from_secs(5), relay_task).await.unwrap().unwrap();
        wait_until_reaped(&transcoder).await;
    }
}
