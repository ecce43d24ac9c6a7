//! Per-task orchestration: persist audio → transcribe → generate
//! documents → terminal bookkeeping.
//!
//! Steps run strictly in order for one task; the task's cancellation
//! token is checked before each step and raced against the transcription
//! call. A step raising a retryable error aborts the remaining steps and
//! bubbles to the queue's retry logic.

use super::task::TaskArtifacts;
use super::{ProcessOptions, ProcessingError, QueueCore};
use crate::audio::AudioData;
use crate::generators::{DEFAULT_LETTER_RECIPIENT, DEFAULT_REFERRAL_CONDITIONS};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything a worker needs for one run, cloned out of the task under
/// the queue lock.
pub(crate) struct TaskInput {
    pub recording_id: i64,
    pub audio_data: Option<AudioData>,
    pub transcript: String,
    pub patient_name: String,
    pub context: String,
    pub options: ProcessOptions,
    pub cancel_token: CancellationToken,
}

/// Worker entry point for a dispatched task.
pub(crate) async fn run(core: Arc<QueueCore>, task_id: String) {
    let started = Instant::now();

    let Some(input) = core.task_input(&task_id) else {
        // Cancelled between dispatch and pickup.
        return;
    };
    let recording_id = input.recording_id;

    log::info!(
        "Queue: starting processing for task {}, recording {}",
        task_id,
        recording_id
    );
    core.notify_status(&task_id, super::TaskStatus::Processing);

    match execute(&core, input).await {
        Ok(artifacts) => core.mark_completed(&task_id, artifacts, started.elapsed()),
        Err(ProcessingError::Cancelled) => core.mark_cancelled_from_worker(&task_id),
        Err(err) => {
            let message = format!("Processing failed: {}", err);
            log::error!("Queue: task {} failed: {}", task_id, message);
            if err.is_retryable() && core.should_retry(&task_id) {
                core.retry_task(&task_id, &message);
            } else {
                core.mark_failed(&task_id, &message);
            }
        }
    }
}

async fn execute(core: &Arc<QueueCore>, input: TaskInput) -> Result<TaskArtifacts, ProcessingError> {
    let TaskInput {
        recording_id,
        audio_data,
        mut transcript,
        patient_name,
        context,
        options,
        cancel_token,
    } = input;

    if cancel_token.is_cancelled() {
        return Err(ProcessingError::Cancelled);
    }

    core.db.mark_processing(recording_id)?;

    let mut artifacts = TaskArtifacts::default();

    // Step 1: transcription, unless a transcript was supplied.
    if transcript.is_empty() {
        if let Some(audio) = &audio_data {
            log::info!("Queue: transcribing audio for recording {}", recording_id);

            // Persist the audio blob first so a failed transcription can be
            // reprocessed from disk. Save failures are logged, not fatal.
            match persist_audio(core, audio, &patient_name) {
                Ok(path) => {
                    let path_str = path.to_string_lossy().to_string();
                    log::info!("Queue: audio saved to {}", path_str);
                    if let Err(e) = core.db.set_audio_path(recording_id, &path_str) {
                        log::warn!(
                            "Queue: failed to record audio path for recording {}: {}",
                            recording_id,
                            e
                        );
                    }
                }
                Err(e) => log::error!("Queue: error saving audio file: {}", e),
            }

            if cancel_token.is_cancelled() {
                return Err(ProcessingError::Cancelled);
            }

            let result = tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    log::info!("Queue: transcription cancelled for recording {}", recording_id);
                    return Err(ProcessingError::Cancelled);
                }

                result = core.stt.transcribe_with_result(audio) => result,
            };

            if result.success && !result.text.is_empty() {
                transcript = result.text.clone();
                core.db.set_transcript(recording_id, &transcript)?;
                artifacts.metadata = result.metadata;
                log::info!(
                    "Queue: transcription completed for recording {}: {} characters",
                    recording_id,
                    transcript.len()
                );
            } else {
                return Err(ProcessingError::Transcription(
                    result
                        .error
                        .unwrap_or_else(|| "Transcription returned empty result".to_string()),
                ));
            }
        } else {
            log::warn!(
                "Queue: no transcript or audio data for recording {}",
                recording_id
            );
        }
    } else {
        log::info!(
            "Queue: using existing transcript for recording {}: {} characters",
            recording_id,
            transcript.len()
        );
    }

    artifacts.transcript = transcript.clone();

    // Step 2: SOAP note.
    if options.generate_soap && !transcript.is_empty() {
        if cancel_token.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }

        log::info!("Queue: generating SOAP note for recording {}", recording_id);
        if !context.is_empty() {
            log::info!(
                "Queue: including context ({} chars) in SOAP generation",
                context.len()
            );
        }

        let soap_note = core.generators.generate_soap(&transcript, &context).await?;
        if soap_note.is_empty() {
            log::warn!(
                "Queue: SOAP generation returned empty result for recording {}",
                recording_id
            );
        } else {
            core.db.set_soap_note(recording_id, &soap_note)?;
            log::info!(
                "Queue: SOAP note generated for recording {}: {} characters",
                recording_id,
                soap_note.len()
            );
            artifacts.soap_note = soap_note;
        }
    }

    // Step 3: referral, derived from the SOAP note.
    if options.generate_referral && !artifacts.soap_note.is_empty() {
        if cancel_token.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }

        let referral = core
            .generators
            .generate_referral(&artifacts.soap_note, DEFAULT_REFERRAL_CONDITIONS)
            .await?;
        if !referral.is_empty() {
            core.db.set_referral(recording_id, &referral)?;
            artifacts.referral = referral;
        }
    }

    // Step 4: letter, preferring the SOAP note over the raw transcript.
    if options.generate_letter {
        let content = if !artifacts.soap_note.is_empty() {
            artifacts.soap_note.clone()
        } else {
            transcript.clone()
        };

        if !content.is_empty() {
            if cancel_token.is_cancelled() {
                return Err(ProcessingError::Cancelled);
            }

            let letter = core
                .generators
                .generate_letter(&content, DEFAULT_LETTER_RECIPIENT, "")
                .await?;
            if !letter.is_empty() {
                core.db.set_letter(recording_id, &letter)?;
                artifacts.letter = letter;
            }
        }
    }

    artifacts.success = true;
    artifacts.completed_at = Some(Utc::now());
    Ok(artifacts)
}

/// Write the audio blob under the storage folder as
/// `recording_<safe_patient_name>_<dd-mm-yy>_<HH-MM-SS>_<8-hex>.wav`.
fn persist_audio(
    core: &Arc<QueueCore>,
    audio: &AudioData,
    patient_name: &str,
) -> Result<PathBuf, ProcessingError> {
    let folder = &core.config.storage_folder;
    std::fs::create_dir_all(folder)
        .map_err(|e| ProcessingError::AudioSave(format!("cannot create {}: {}", folder.display(), e)))?;

    let now = chrono::Local::now();
    // The random suffix keeps concurrent saves for the same patient from
    // colliding.
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    let filename = format!(
        "recording_{}_{}_{}_{}.wav",
        sanitize_patient_name(patient_name),
        now.format("%d-%m-%y"),
        now.format("%H-%M-%S"),
        suffix
    );
    let path = folder.join(filename);

    let wav = audio
        .to_wav_bytes()
        .map_err(|e| ProcessingError::AudioSave(e.to_string()))?;
    std::fs::write(&path, wav)
        .map_err(|e| ProcessingError::AudioSave(format!("{}: {}", path.display(), e)))?;

    Ok(path)
}

/// Restrict patient names to `[A-Za-z0-9 _-]`, at most 50 characters.
fn sanitize_patient_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .take(50)
        .collect();
    let safe = safe.trim().to_string();
    if safe.is_empty() {
        "Patient".to_string()
    } else {
        safe
    }
}
