//! Spoken command dispatch
//!
//! The speech recognizer hands over the recognized text; this maps it onto
//! recording commands and produces the sentence to speak back.

use super::recording::{
    is_recording, recording_status, start_recording, stop_recording, RecorderState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCommand {
    StartRecording,
    StopRecording,
    RecordingStatus,
}

/// Checked in order; the first phrase contained in the text wins
const PHRASES: &[(&str, VoiceCommand)] = &[
    ("start recording", VoiceCommand::StartRecording),
    ("begin recording", VoiceCommand::StartRecording),
    ("stop recording", VoiceCommand::StopRecording),
    ("end recording", VoiceCommand::StopRecording),
    ("are you recording", VoiceCommand::RecordingStatus),
    ("recording status", VoiceCommand::RecordingStatus),
];

impl VoiceCommand {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim().to_lowercase();
        PHRASES
            .iter()
            .find(|(phrase, _)| text.contains(phrase))
            .map(|(_, command)| *command)
    }
}

/// Run the command in `text`, returning the reply to speak.
/// `None` means the text held no recording command.
pub async fn dispatch_phrase(state: &RecorderState, text: &str) -> Option<String> {
    let command = VoiceCommand::parse(text)?;
    tracing::debug!("Voice command {:?} from {:?}", command, text);

    let reply = match command {
        VoiceCommand::StartRecording => {
            let was_recording = is_recording(state).await.unwrap_or(false);
            match start_recording(state).await {
                Ok(_) if was_recording => "I'm already recording.".to_string(),
                Ok(_) => "Starting screen recording.".to_string(),
                Err(e) => {
                    tracing::warn!("Voice start failed: {}", e.message);
                    format!("I couldn't start recording. {}", e.message)
                }
            }
        }
        VoiceCommand::StopRecording => match stop_recording(state).await {
            Ok(Some(clip)) if clip.degraded => {
                "Recording stopped, but the clip may be damaged.".to_string()
            }
            Ok(Some(_)) => "Stopping the recording now.".to_string(),
            Ok(None) => "I'm not recording.".to_string(),
            Err(e) => format!("I couldn't stop recording. {}", e.message),
        },
        VoiceCommand::RecordingStatus => match recording_status(state).await {
            Ok(snapshot) if snapshot.status.is_active() => {
                let seconds = snapshot.elapsed_ms.unwrap_or(0) / 1000;
                format!("Recording for {} seconds.", seconds)
            }
            _ => "I'm not recording.".to_string(),
        },
    };

    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RecorderConfig, SourceConfig};

    #[test]
    fn test_parse_phrases() {
        assert_eq!(VoiceCommand::parse("Start Recording"), Some(VoiceCommand::StartRecording));
        assert_eq!(
            VoiceCommand::parse("hey simian, begin recording please"),
            Some(VoiceCommand::StartRecording)
        );
        assert_eq!(VoiceCommand::parse("  END RECORDING "), Some(VoiceCommand::StopRecording));
        assert_eq!(VoiceCommand::parse("are you recording?"), Some(VoiceCommand::RecordingStatus));
        assert_eq!(VoiceCommand::parse("open spotify"), None);
    }

    #[tokio::test]
    async fn test_dispatch_drives_the_manager() {
        let dir = tempfile::tempdir().unwrap();
        let state = RecorderState::new(RecorderConfig::native(
            dir.path(),
            vec![SourceConfig::Synthetic {
                width: 8,
                height: 8,
                fail_after: None,
            }],
        ));

        assert_eq!(dispatch_phrase(&state, "wake up").await, None);
        assert_eq!(
            dispatch_phrase(&state, "stop recording").await.as_deref(),
            Some("I'm not recording.")
        );
        assert_eq!(
            dispatch_phrase(&state, "start recording").await.as_deref(),
            Some("Starting screen recording.")
        );
        assert!(state.manager.is_running());
        assert_eq!(
            dispatch_phrase(&state, "begin recording").await.as_deref(),
            Some("I'm already recording.")
        );
        assert!(dispatch_phrase(&state, "recording status")
            .await
            .is_some_and(|reply| reply.starts_with("Recording for")));
        assert_eq!(
            dispatch_phrase(&state, "stop recording").await.as_deref(),
            Some("Stopping the recording now.")
        );
        assert!(!state.manager.is_running());
    }
}
