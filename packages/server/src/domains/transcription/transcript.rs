//! Transcript artifact file: a metadata header followed by the body,
//! segment-per-block when timing data is available.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::job::Job;
use crate::kernel::engine::{Segment, Transcription};

/// `HH:MM:SS` from a second offset.
fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

fn format_segment(segment: &Segment) -> String {
    let range = format!(
        "[{} - {}]",
        format_timestamp(segment.start_seconds),
        format_timestamp(segment.end_seconds)
    );
    match &segment.speaker {
        Some(speaker) => format!("{} {}: {}", range, speaker, segment.text.trim()),
        None => format!("{} {}", range, segment.text.trim()),
    }
}

/// Render the full artifact text.
pub fn format_transcript(job: &Job, transcription: &Transcription, now: DateTime<Utc>) -> String {
    let size_mb = job.file_size_bytes as f64 / (1024.0 * 1024.0);
    let duration = if transcription.duration_seconds > 0.0 {
        format!("{:.1}", transcription.duration_seconds)
    } else {
        "unknown".to_string()
    };
    let language = if transcription.language.is_empty() {
        job.language.clone().unwrap_or_else(|| "auto".to_string())
    } else {
        transcription.language.clone()
    };

    let mut out = String::new();
    out.push_str("# Transcription Metadata\n");
    out.push_str(&format!("# File: {}\n", job.original_filename));
    out.push_str(&format!("# Size: {:.1}MB\n", size_mb));
    out.push_str(&format!("# Model: {}\n", job.model_tier));
    out.push_str(&format!(
        "# Transcribed: {} UTC\n",
        now.format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!("# Duration: {} seconds\n", duration));
    out.push_str(&format!("# Language: {}\n\n", language));

    match transcription.segments.as_deref() {
        Some(segments) if !segments.is_empty() => {
            let body: Vec<String> = segments.iter().map(format_segment).collect();
            out.push_str(&body.join("\n\n"));
            out.push('\n');
        }
        _ => {
            out.push_str(&transcription.text);
            if !transcription.text.ends_with('\n') {
                out.push('\n');
            }
        }
    }

    out
}

/// Write the artifact under `output_folder`, named after the upload.
pub async fn write_transcript(
    output_folder: &Path,
    job: &Job,
    transcription: &Transcription,
) -> Result<PathBuf> {
    let stem = Path::new(&job.original_filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("transcript");
    let output_path = output_folder.join(format!("{}.txt", stem));

    tokio::fs::create_dir_all(output_folder)
        .await
        .context("create output folder")?;

    let content = format_transcript(job, transcription, Utc::now());
    tokio::fs::write(&output_path, content)
        .await
        .with_context(|| format!("write transcript {}", output_path.display()))?;

    Ok(output_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::transcription::{JobStatus, NewJob};
    use crate::kernel::engine::ModelTier;

    fn sample_job() -> Job {
        let mut job = NewJob {
            id: uuid::Uuid::new_v4(),
            original_filename: "briefing.wav".to_string(),
            file_path: "/work/uploads/briefing.wav".to_string(),
            file_size_bytes: 1024 * 1024,
            model_tier: ModelTier::Tiny,
            language: None,
            priority: 9,
            max_retries: 3,
        }
        .into_job();
        job.status = JobStatus::Processing;
        job
    }

    fn plain_transcription() -> Transcription {
        Transcription {
            text: "hello from the meeting".to_string(),
            language: "en".to_string(),
            duration_seconds: 42.5,
            segments: None,
        }
    }

    #[test]
    fn timestamps_format_as_hms() {
        assert_eq!(format_timestamp(0.0), "00:00:00");
        assert_eq!(format_timestamp(59.9), "00:00:59");
        assert_eq!(format_timestamp(61.0), "00:01:01");
        assert_eq!(format_timestamp(3723.0), "01:02:03");
    }

    #[test]
    fn header_carries_job_metadata() {
        let now = Utc::now();
        let out = format_transcript(&sample_job(), &plain_transcription(), now);

        assert!(out.starts_with("# Transcription Metadata\n"));
        assert!(out.contains("# File: briefing.wav\n"));
        assert!(out.contains("# Size: 1.0MB\n"));
        assert!(out.contains("# Model: tiny\n"));
        assert!(out.contains("# Duration: 42.5 seconds\n"));
        assert!(out.contains("# Language: en\n\n"));
        assert!(out.ends_with("hello from the meeting\n"));
    }

    #[test]
    fn diarized_segments_carry_speaker_labels() {
        let transcription = Transcription {
            text: "a b".to_string(),
            language: "en".to_string(),
            duration_seconds: 10.0,
            segments: Some(vec![
                Segment {
                    start_seconds: 0.0,
                    end_seconds: 4.0,
                    text: "good morning".to_string(),
                    speaker: Some("SPEAKER_00".to_string()),
                },
                Segment {
                    start_seconds: 4.0,
                    end_seconds: 9.0,
                    text: "morning".to_string(),
                    speaker: None,
                },
            ]),
        };

        let out = format_transcript(&sample_job(), &transcription, Utc::now());
        assert!(out.contains("[00:00:00 - 00:00:04] SPEAKER_00: good morning"));
        assert!(out.contains("[00:00:04 - 00:00:09] morning"));
        // Segments are separated by a blank line.
        assert!(out.contains("good morning\n\n[00:00:04"));
    }

    #[tokio::test]
    async fn writes_artifact_named_after_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_transcript(dir.path(), &sample_job(), &plain_transcription())
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("briefing.txt"));
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("hello from the meeting"));
    }
}
