//! The external services the assisted flow depends on: face verification,
//! speech-to-text and gesture recognition, plus the announcer that speaks
//! prompts back to the voter.

use reqwest::{Client, StatusCode};
use rocket::serde::json::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::model::voter::VoterId;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The service ran but could not make sense of the input.
    #[error("input was not understood")]
    Unrecognised,
    #[error("assistive service unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for CaptureError {
    fn from(err: reqwest::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

#[rocket::async_trait]
pub trait FaceVerifier: Send + Sync {
    /// Capture the voter's face and compare it with their reference image.
    async fn verify_face(&self, voter: VoterId) -> Result<bool, CaptureError>;
}

#[rocket::async_trait]
pub trait SpeechSource: Send + Sync {
    /// Record one utterance and return its transcript.
    async fn listen(&self) -> Result<String, CaptureError>;
}

#[rocket::async_trait]
pub trait GestureSource: Send + Sync {
    /// Watch for one hand gesture. `None` if no hand was seen.
    async fn detect(&self) -> Result<Option<String>, CaptureError>;
}

/// Receives the prompts and feedback meant for the voter.
pub trait Announcer: Send {
    fn announce(&mut self, message: String);
}

/// Announcer that keeps everything it was told, in order, to be returned to
/// the client for playback.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Transcript(Vec<String>);

impl Transcript {
    pub fn messages(&self) -> &[String] {
        &self.0
    }
}

impl Announcer for Transcript {
    fn announce(&mut self, message: String) {
        debug!("Announcing: {message}");
        self.0.push(message);
    }
}

#[derive(Serialize)]
struct FaceRequest {
    #[serde(rename = "userId")]
    user_id: VoterId,
}

#[derive(Deserialize)]
struct FaceVerdict {
    verified: bool,
}

#[derive(Deserialize)]
struct SpeechResult {
    text: String,
}

/// The recogniser reports a class label ("One", "Two", ...), a number, or
/// the label `0` when no hand was found.
#[derive(Deserialize)]
struct GestureResult {
    #[serde(default)]
    label: Value,
    number: Option<u32>,
}

impl GestureResult {
    fn gesture(self) -> Option<String> {
        if let Some(number) = self.number.filter(|n| *n > 0) {
            return Some(number.to_string());
        }
        match self.label {
            Value::String(label) if !label.trim().is_empty() => Some(label),
            Value::Number(number) => number
                .as_u64()
                .filter(|n| *n > 0)
                .map(|n| n.to_string()),
            _ => None,
        }
    }
}

/// Client for the assistive services, all served from one base URL.
pub struct HttpAssistServices {
    client: Client,
    base_url: String,
}

impl HttpAssistServices {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.assist_timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.assist_service_url().to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

fn unavailable(service: &str, status: StatusCode) -> CaptureError {
    CaptureError::Unavailable(format!("{service} service answered {status}"))
}

#[rocket::async_trait]
impl FaceVerifier for HttpAssistServices {
    async fn verify_face(&self, voter: VoterId) -> Result<bool, CaptureError> {
        let response = self
            .client
            .post(self.url("start-face-recognition"))
            .json(&FaceRequest { user_id: voter })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(unavailable("face recognition", response.status()));
        }
        let verdict: FaceVerdict = response.json().await?;
        Ok(verdict.verified)
    }
}

#[rocket::async_trait]
impl SpeechSource for HttpAssistServices {
    async fn listen(&self) -> Result<String, CaptureError> {
        let response = self.client.get(self.url("start-recording")).send().await?;
        let status = response.status();
        if status.is_client_error() {
            return Err(CaptureError::Unrecognised);
        }
        if !status.is_success() {
            return Err(unavailable("speech", status));
        }
        let result: SpeechResult = response.json().await?;
        Ok(result.text)
    }
}

#[rocket::async_trait]
impl GestureSource for HttpAssistServices {
    async fn detect(&self) -> Result<Option<String>, CaptureError> {
        let response = self.client.post(self.url("detect")).send().await?;
        if !response.status().is_success() {
            return Err(unavailable("gesture", response.status()));
        }
        let result: GestureResult = response.json().await?;
        Ok(result.gesture())
    }
}
