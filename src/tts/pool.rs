//! C6 TTS Worker Pool: N persistent-connection workers draining a bounded
//! task queue, each running the `idle/working/reconnecting/terminated`
//! state machine of §4.6.
//!
//! The cancellation pattern (`tokio::select!` racing a `CancellationToken`
//! against the suspending operation) is grounded on
//! `gglib-download`'s `manager::worker::run_job`/`execute_download`, the
//! only cancellation-token-based worker loop in the retrieved pack; the
//! teacher itself only bounds concurrency with `buffer_unordered` and has no
//! persistent-connection worker of its own.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::warn;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{ConversionError, ErrorKind};
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::retry::{InfiniteRetry, RetryStrategy};
use crate::tts::{AudioFragment, SynthesisTask, TtsConnector, WorkerState};

/// Worker count, clamped to `[1, 30]` and never exceeding the pending task
/// count (§4.6: `N = min(ttsThreads, pending_tasks)`).
pub fn worker_count(tts_threads: usize, pending_tasks: usize) -> usize {
    tts_threads.clamp(1, 30).min(pending_tasks.max(1))
}

/// Runs `tasks` through a pool of `worker_count(tts_threads, tasks.len())`
/// workers and returns the completed fragments, in no particular order —
/// callers reorder by `part_index` (§5 Ordering guarantees; §9 Concurrent
/// worker pool).
pub async fn run_pool(
    connector: Arc<dyn TtsConnector>,
    tasks: Vec<SynthesisTask>,
    tts_threads: usize,
    cancel: CancellationToken,
    progress: ProgressCallback,
) -> Result<Vec<AudioFragment>, ConversionError> {
    if tasks.is_empty() {
        return Ok(Vec::new());
    }

    let n = worker_count(tts_threads, tasks.len());
    let queue_capacity = 4 * n;
    let total = tasks.len() as u64;

    let (task_tx, task_rx) = mpsc::channel::<SynthesisTask>(queue_capacity);
    let task_rx = Arc::new(Mutex::new(task_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<Result<AudioFragment, ConversionError>>(queue_capacity);

    let producer_cancel = cancel.clone();
    let producer = tokio::spawn(async move {
        for task in tasks {
            tokio::select! {
                biased;
                _ = producer_cancel.cancelled() => break,
                send_result = task_tx.send(task) => {
                    if send_result.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let reconnecting_count = Arc::new(AtomicUsize::new(0));
    let plateau_warned = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::with_capacity(n);
    for _ in 0..n {
        let connector = connector.clone();
        let task_rx = task_rx.clone();
        let result_tx = result_tx.clone();
        let cancel = cancel.clone();
        let progress = progress.clone();
        let reconnecting_count = reconnecting_count.clone();
        let plateau_warned = plateau_warned.clone();
        let completed = completed.clone();
        workers.push(tokio::spawn(async move {
            run_worker(
                connector,
                task_rx,
                result_tx,
                cancel,
                progress,
                reconnecting_count,
                plateau_warned,
                completed,
                n,
                total,
            )
            .await;
        }));
    }
    drop(result_tx);

    let mut fragments = Vec::with_capacity(total as usize);
    let mut first_error = None;
    while let Some(result) = result_rx.recv().await {
        match result {
            Ok(fragment) => fragments.push(fragment),
            Err(err) => {
                if first_error.is_none() {
                    cancel.cancel();
                    first_error = Some(err);
                }
            }
        }
    }

    producer.abort();
    for worker in workers {
        let _ = worker.await;
    }

    if let Some(err) = first_error {
        return Err(err);
    }
    Ok(fragments)
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    connector: Arc<dyn TtsConnector>,
    task_rx: Arc<Mutex<mpsc::Receiver<SynthesisTask>>>,
    result_tx: mpsc::Sender<Result<AudioFragment, ConversionError>>,
    cancel: CancellationToken,
    progress: ProgressCallback,
    reconnecting_count: Arc<AtomicUsize>,
    plateau_warned: Arc<std::sync::atomic::AtomicBool>,
    completed: Arc<AtomicUsize>,
    worker_total: usize,
    task_total: u64,
) {
    let mut state = WorkerState::Idle;
    let mut connection = match connector.open().await {
        Ok(c) => c,
        Err(err) => {
            let _ = result_tx.send(Err(err)).await;
            return;
        }
    };

    loop {
        if state == WorkerState::Terminated {
            break;
        }

        let task = {
            let mut rx = task_rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    state = WorkerState::Terminated;
                    None
                }
                maybe_task = rx.recv() => maybe_task,
            }
        };

        let Some(task) = task else {
            break;
        };

        state = WorkerState::Working;
        let mut attempt = 0u32;

        'attempt: loop {
            if cancel.is_cancelled() {
                state = WorkerState::Terminated;
                break 'attempt;
            }

            match connection
                .send(&task.text, &task.voice_id, task.rate, task.pitch)
                .await
            {
                Ok(bytes) => {
                    state = WorkerState::Idle;
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    progress(ProgressEvent::Step {
                        step: "tts_conversion",
                        completed: done as u64,
                        total: task_total,
                    });
                    let _ = result_tx
                        .send(Ok(AudioFragment {
                            part_index: task.part_index,
                            bytes,
                        }))
                        .await;
                    break 'attempt;
                }
                Err(err) if err.kind == ErrorKind::TtsInvalidVoice => {
                    state = WorkerState::Terminated;
                    let _ = result_tx.send(Err(err)).await;
                    break 'attempt;
                }
                Err(err) => {
                    state = WorkerState::Reconnecting;
                    let currently_reconnecting = reconnecting_count.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!("tts worker: part {} failed ({}), reconnecting", task.part_index, err.kind);
                    connection.close().await;

                    let strategy = InfiniteRetry;
                    let delay = strategy.delay_for(attempt);
                    let plateau = delay >= std::time::Duration::from_secs(600);
                    if plateau
                        && currently_reconnecting == worker_total
                        && !plateau_warned.swap(true, Ordering::SeqCst)
                    {
                        warn!("all {worker_total} TTS workers reconnecting, schedule at plateau");
                        progress(ProgressEvent::Warning {
                            message: "all TTS workers reconnecting, schedule at plateau".to_string(),
                        });
                    }

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            reconnecting_count.fetch_sub(1, Ordering::SeqCst);
                            state = WorkerState::Terminated;
                            break 'attempt;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    reconnecting_count.fetch_sub(1, Ordering::SeqCst);

                    match connector.open().await {
                        Ok(new_connection) => {
                            connection = new_connection;
                            attempt += 1;
                            state = WorkerState::Working;
                            continue 'attempt;
                        }
                        Err(err) => {
                            let _ = result_tx.send(Err(err)).await;
                            state = WorkerState::Terminated;
                            break 'attempt;
                        }
                    }
                }
            }
        }

        if state == WorkerState::Terminated {
            break;
        }
    }

    connection.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FlakyConnection {
        fail_first: Arc<AtomicU32>,
    }

    #[async_trait]
    impl crate::tts::TtsConnection for FlakyConnection {
        async fn send(&mut self, text: &str, _voice_id: &str, _rate: i32, _pitch: i32) -> Result<Vec<u8>, ConversionError> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(ConversionError::new(ErrorKind::TtsWebsocketFailed, "dropped"));
            }
            Ok(text.as_bytes().to_vec())
        }

        async fn close(&mut self) {}
    }

    struct FlakyConnector {
        fail_first: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TtsConnector for FlakyConnector {
        async fn open(&self) -> Result<Box<dyn crate::tts::TtsConnection>, ConversionError> {
            Ok(Box::new(FlakyConnection {
                fail_first: self.fail_first.clone(),
            }))
        }
    }

    struct InvalidVoiceConnector;

    struct InvalidVoiceConnection;

    #[async_trait]
    impl crate::tts::TtsConnection for InvalidVoiceConnection {
        async fn send(&mut self, _text: &str, _voice_id: &str, _rate: i32, _pitch: i32) -> Result<Vec<u8>, ConversionError> {
            Err(ConversionError::new(ErrorKind::TtsInvalidVoice, "no such voice"))
        }
        async fn close(&mut self) {}
    }

    #[async_trait]
    impl TtsConnector for InvalidVoiceConnector {
        async fn open(&self) -> Result<Box<dyn crate::tts::TtsConnection>, ConversionError> {
            Ok(Box::new(InvalidVoiceConnection))
        }
    }

    fn task(part_index: u64) -> SynthesisTask {
        SynthesisTask {
            part_index,
            text: format!("fragment {part_index}"),
            voice_id: "v1".to_string(),
            rate: 0,
            pitch: 0,
        }
    }

    #[tokio::test]
    async fn worker_count_clamps_to_pending_tasks_and_max() {
        assert_eq!(worker_count(15, 3), 3);
        assert_eq!(worker_count(99, 100), 30);
        assert_eq!(worker_count(0, 100), 1);
    }

    #[tokio::test]
    async fn happy_path_produces_one_fragment_per_task() {
        let connector = Arc::new(FlakyConnector {
            fail_first: Arc::new(AtomicU32::new(0)),
        });
        let tasks = vec![task(0), task(1), task(2)];
        let fragments = run_pool(
            connector,
            tasks,
            2,
            CancellationToken::new(),
            crate::progress::noop_callback(),
        )
        .await
        .unwrap();
        assert_eq!(fragments.len(), 3);
    }

    #[tokio::test]
    async fn retriable_failure_recovers_and_still_delivers_fragment() {
        let connector = Arc::new(FlakyConnector {
            fail_first: Arc::new(AtomicU32::new(1)),
        });
        let tasks = vec![task(0)];
        let fragments = run_pool(
            connector,
            tasks,
            1,
            CancellationToken::new(),
            crate::progress::noop_callback(),
        )
        .await
        .unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].bytes, b"fragment 0".to_vec());
    }

    #[tokio::test]
    async fn invalid_voice_fails_the_whole_pool_immediately() {
        let connector = Arc::new(InvalidVoiceConnector);
        let tasks = vec![task(0), task(1)];
        let err = run_pool(
            connector,
            tasks,
            2,
            CancellationToken::new(),
            crate::progress::noop_callback(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TtsInvalidVoice);
    }

    #[tokio::test]
    async fn cancellation_stops_the_pool_without_error_cascade() {
        let connector = Arc::new(FlakyConnector {
            fail_first: Arc::new(AtomicU32::new(0)),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tasks = vec![task(0), task(1)];
        let fragments = run_pool(connector, tasks, 2, cancel, crate::progress::noop_callback())
            .await
            .unwrap();
        assert!(fragments.len() <= 2);
    }
}
