pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

mod twiml {
    use xmlserde::xml_serde_enum;
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Say")]
        Say(SayAction),
        #[xmlserde(name = b"Dial")]
        Dial(DialAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct SayAction {
        #[xmlserde(ty = "text")]
        pub text: String,
        #[xmlserde(name = b"voice", ty = "attr")]
        pub voice: Option<String>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub struct DialAction {
        #[xmlserde(name = b"timeout", ty = "attr")]
        pub timeout: Option<u32>,
        #[xmlserde(ty = "untag")]
        pub target: DialTarget,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum DialTarget {
        #[xmlserde(name = b"Conference")]
        Conference(ConferenceNoun),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct ConferenceNoun {
        #[xmlserde(ty = "text")]
        pub name: String,
        #[xmlserde(name = b"muted", ty = "attr")]
        pub muted: Option<TwimlBool>,
        #[xmlserde(name = b"beep", ty = "attr")]
        pub beep: Option<TwimlBool>,
        #[xmlserde(name = b"startConferenceOnEnter", ty = "attr")]
        pub start_conference_on_enter: Option<TwimlBool>,
        #[xmlserde(name = b"endConferenceOnExit", ty = "attr")]
        pub end_conference_on_exit: Option<TwimlBool>,
    }

    xml_serde_enum! {
        #[derive(PartialEq, Eq, Debug)]
        TwimlBool {
            True => "true",
            False => "false",
        }
    }
}
pub use twiml::*;

mod callbacks {
    use serde::Deserialize;
    use std::str::FromStr;
    use uuid::Uuid;

    /// Call progress values Twilio reports in `CallStatus`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TwilioCallStatus {
        Queued,
        Initiated,
        Ringing,
        InProgress,
        Answered,
        Completed,
        Busy,
        NoAnswer,
        Failed,
        Canceled,
    }

    impl FromStr for TwilioCallStatus {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "queued" => Ok(Self::Queued),
                "initiated" => Ok(Self::Initiated),
                "ringing" => Ok(Self::Ringing),
                "in-progress" => Ok(Self::InProgress),
                "answered" => Ok(Self::Answered),
                "completed" => Ok(Self::Completed),
                "busy" => Ok(Self::Busy),
                "no-answer" => Ok(Self::NoAnswer),
                "failed" => Ok(Self::Failed),
                "canceled" => Ok(Self::Canceled),
                other => Err(other.to_string()),
            }
        }
    }

    /// Session id echoed back on callback URLs we hand to Twilio.
    #[derive(Deserialize, Debug, Default)]
    pub struct CallbackQuery {
        pub session_id: Option<Uuid>,
    }

    /// `StatusCallback` body. Status stays a string so unknown values reach the state machine's
    /// lookup, which logs and drops them.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct CallStatusCallback {
        pub call_sid: String,
        pub call_status: String,
        pub call_duration: Option<i32>,
        pub from: Option<String>,
        pub to: Option<String>,
        pub recording_sid: Option<String>,
        pub recording_url: Option<String>,
        pub recording_duration: Option<i32>,
    }

    /// `RecordingStatusCallback` body.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct RecordingStatusCallback {
        pub call_sid: String,
        pub recording_sid: String,
        pub recording_url: String,
        pub recording_status: String,
        pub recording_duration: Option<i32>,
    }

    /// Voice webhook body for a call arriving on one of our numbers.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct TwilioVoicePayload {
        pub call_sid: String,
        pub call_status: String,
        pub from: String,
        pub to: String,
        pub direction: Option<String>,
    }
}
pub use callbacks::*;

mod rest {
    use serde::Deserialize;

    #[derive(Deserialize, Debug)]
    pub struct TwilioCallResource {
        pub sid: String,
        pub status: String,
    }

    #[derive(Deserialize, Debug)]
    pub struct TwilioParticipantResource {
        pub call_sid: String,
        pub conference_sid: Option<String>,
        #[serde(default)]
        pub muted: bool,
        #[serde(default)]
        pub coaching: bool,
    }

    #[derive(Deserialize, Debug)]
    pub struct TwilioErrorResponse {
        pub code: Option<u32>,
        pub message: String,
        pub status: u16,
    }
}
pub use rest::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conference_twiml_renders() {
        let response = Response {
            actions: vec![ResponseAction::Dial(DialAction {
                timeout: None,
                target: DialTarget::Conference(ConferenceNoun {
                    name: "session-abc".to_string(),
                    start_conference_on_enter: Some(TwimlBool::True),
                    end_conference_on_exit: Some(TwimlBool::True),
                    ..Default::default()
                }),
            })],
        };
        let twiml = wrap_twiml(xmlserde::xml_serialize(response));
        assert!(twiml.starts_with("<?xml"));
        assert!(twiml.contains("<Dial"));
        assert!(twiml.contains("startConferenceOnEnter=\"true\""));
        assert!(twiml.contains(">session-abc</Conference>"));
    }

    #[test]
    fn status_callback_parses_from_form_body() {
        let body = "CallSid=CA123&CallStatus=no-answer&CallDuration=0&From=%2B15550001111&To=%2B15550002222";
        let payload = serde_urlencoded::from_str::<CallStatusCallback>(body).unwrap();
        assert_eq!(payload.call_sid, "CA123");
        assert_eq!(payload.call_duration, Some(0));
        assert_eq!(
            payload.call_status.parse::<TwilioCallStatus>(),
            Ok(TwilioCallStatus::NoAnswer)
        );
        assert!(payload.recording_sid.is_none());
    }

    #[test]
    fn unknown_status_is_rejected_by_lookup() {
        assert!("on-hold".parse::<TwilioCallStatus>().is_err());
        assert_eq!(
            "In-Progress".parse::<TwilioCallStatus>(),
            Ok(TwilioCallStatus::InProgress)
        );
    }
}
