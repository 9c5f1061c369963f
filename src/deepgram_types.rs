use serde::{Deserialize, Serialize};

/// Body of a pre-recorded `/v1/listen` request that points Deepgram at a hosted file.
#[derive(Serialize, Debug)]
pub struct ListenByUrl<'a> {
    pub url: &'a str,
}

#[derive(Deserialize, Debug)]
pub struct PrerecordedResponse {
    #[serde(default)]
    pub metadata: Option<ResponseMetadata>,
    pub results: PrerecordedResults,
}

#[derive(Deserialize, Debug)]
pub struct ResponseMetadata {
    pub request_id: String,
}

#[derive(Deserialize, Debug)]
pub struct PrerecordedResults {
    pub channels: Vec<Channel>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Channel {
    pub alternatives: Vec<Alternative>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Alternative {
    pub transcript: String,
    pub confidence: f32,
}

impl PrerecordedResponse {
    /// Top alternative of the first channel.
    pub fn best_alternative(&self) -> Option<&Alternative> {
        self.results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
    }
}
