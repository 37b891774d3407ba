//! Assisted voting: drives speech or gesture input for voters who cannot use
//! the regular ballot, and funnels the resolved choice into the vote ledger.

use std::future::Future;
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use rocket::tokio::time::timeout;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{
    auth::Identity,
    ledger::{VoteLedger, VoteReceipt, Voteability},
    poll::PollState,
    registry::PollRegistry,
    voter::VoterId,
};

mod collaborators;
mod resolver;

pub use collaborators::{
    Announcer, CaptureError, FaceVerifier, GestureSource, HttpAssistServices, SpeechSource,
    Transcript,
};
pub use resolver::{CandidateResolver, GestureResolver, Resolution, SpeechResolver};

static DEFAULT_SPEECH_RESOLVER: SpeechResolver =
    SpeechResolver::with_threshold(resolver::SPEECH_THRESHOLD);

/// The input channel substituted for the regular ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Modality {
    Speech,
    Gesture,
}

impl Modality {
    /// Visual assistance wins over physical assistance; the two never run together.
    pub fn for_voter(voter: &Identity) -> Result<Self> {
        if voter.is_blind {
            Ok(Self::Speech)
        } else if voter.is_disabled {
            Ok(Self::Gesture)
        } else {
            Err(Error::validation(
                "accessibility",
                "voter has no assistive input enabled",
            ))
        }
    }
}

/// Where an assisted session is in its flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    VerifyingFace,
    SpeechCapture { attempt: u32 },
    GestureCapture,
    Resolving,
    CastPending { candidate: String },
    Retry { attempt: u32 },
    Done,
    Abandoned,
}

/// How an assisted session ended, short of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome")]
pub enum AssistOutcome {
    Voted { receipt: VoteReceipt },
    FaceRejected,
    NoGesture,
    InvalidGesture { code: String },
    Abandoned,
}

/// The collaborating services a session calls out to, and the strategies
/// that turn their raw output into a candidate.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub face: &'a dyn FaceVerifier,
    pub speech: &'a dyn SpeechSource,
    pub gesture: &'a dyn GestureSource,
    pub speech_resolver: &'a dyn CandidateResolver,
    pub gesture_resolver: &'a dyn CandidateResolver,
}

impl<'a> Collaborators<'a> {
    /// Use the given services with fuzzy name matching and 1-based gesture codes.
    pub fn new(
        face: &'a dyn FaceVerifier,
        speech: &'a dyn SpeechSource,
        gesture: &'a dyn GestureSource,
    ) -> Self {
        Self {
            face,
            speech,
            gesture,
            speech_resolver: &DEFAULT_SPEECH_RESOLVER,
            gesture_resolver: &GestureResolver,
        }
    }

    pub fn http(services: &'a HttpAssistServices) -> Self {
        Self::new(services, services, services)
    }

    pub fn with_resolvers(
        self,
        speech_resolver: &'a dyn CandidateResolver,
        gesture_resolver: &'a dyn CandidateResolver,
    ) -> Self {
        Self {
            speech_resolver,
            gesture_resolver,
            ..self
        }
    }
}

/// Limits applied to one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Upper bound on each collaborator call.
    pub call_timeout: Duration,
    pub max_speech_attempts: u32,
}

/// One voter's run through the assisted flow.
///
/// A session casts at most once: it only runs from [`SessionState::Idle`],
/// and every path through it ends in `Done` or `Abandoned`.
pub struct AssistedSession<'a> {
    voter: Identity,
    registry: PollRegistry,
    ledger: VoteLedger,
    collaborators: Collaborators<'a>,
    limits: SessionLimits,
    state: SessionState,
}

impl<'a> AssistedSession<'a> {
    pub fn new(
        voter: Identity,
        registry: PollRegistry,
        ledger: VoteLedger,
        collaborators: Collaborators<'a>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            voter,
            registry,
            ledger,
            collaborators,
            limits,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    fn enter(&mut self, state: SessionState) {
        trace!("Assisted session for voter {}: {:?}", self.voter.id, state);
        self.state = state;
    }

    /// Run the session to completion, announcing prompts and feedback along
    /// the way.
    pub async fn run(&mut self, announcer: &mut dyn Announcer) -> Result<AssistOutcome> {
        if self.state != SessionState::Idle {
            return Err(Error::SessionBusy(self.voter.id));
        }
        let modality = Modality::for_voter(&self.voter)?;

        let poll = match self.registry.poll().await? {
            Some(poll) if poll.state == PollState::Running => poll,
            Some(poll) => return Err(Error::PollNotOpen(poll.state)),
            None => return Err(Error::PollNotOpen(PollState::NotStarted)),
        };
        if self.ledger.check_voteability(self.voter.id).await? == Voteability::Voted {
            return Err(Error::AlreadyVoted {
                voter: self.voter.id,
                poll: poll.id,
            });
        }
        info!(
            "Voter {} started an assisted {:?} session",
            self.voter.id, modality
        );

        let result = self.drive(modality, announcer).await;
        if !matches!(result, Ok(AssistOutcome::Voted { .. })) {
            self.enter(SessionState::Abandoned);
        }
        result
    }

    async fn drive(
        &mut self,
        modality: Modality,
        announcer: &mut dyn Announcer,
    ) -> Result<AssistOutcome> {
        self.enter(SessionState::VerifyingFace);
        announcer.announce("Verifying face. Please wait.".to_string());
        let face = self.collaborators.face;
        let verified = match self.bounded(face.verify_face(self.voter.id)).await {
            Ok(verified) => verified,
            Err(err) => {
                announcer.announce("Error during face verification. Please try again.".into());
                return Err(collaborator_error("face verification", err));
            }
        };
        if !verified {
            warn!("Face verification failed for voter {}", self.voter.id);
            announcer.announce("Face verification failed. Please try again.".to_string());
            return Ok(AssistOutcome::FaceRejected);
        }
        announcer.announce("Face verified.".to_string());

        let candidates = self.registry.snapshot().await?.candidates;
        match modality {
            Modality::Speech => self.speech(&candidates, announcer).await,
            Modality::Gesture => self.gesture(&candidates, announcer).await,
        }
    }

    async fn speech(
        &mut self,
        candidates: &[String],
        announcer: &mut dyn Announcer,
    ) -> Result<AssistOutcome> {
        let resolver = self.collaborators.speech_resolver;
        let speech = self.collaborators.speech;
        for attempt in 1..=self.limits.max_speech_attempts {
            self.enter(SessionState::SpeechCapture { attempt });
            announcer.announce(format!(
                "Whom do you want to vote for? {}",
                candidates.join(" or ")
            ));

            let transcript = match self.bounded(speech.listen()).await {
                Ok(transcript) => transcript,
                Err(CaptureError::Unrecognised) => {
                    announcer.announce(
                        "Could not recognize the candidate name. Please try again.".to_string(),
                    );
                    self.enter(SessionState::Retry { attempt });
                    continue;
                }
                Err(err) => {
                    announcer.announce("Error during voting process. Please try again.".into());
                    return Err(collaborator_error("speech", err));
                }
            };

            self.enter(SessionState::Resolving);
            match resolver.resolve(&transcript, candidates) {
                Resolution::Match(candidate) => return self.cast(candidate, announcer).await,
                Resolution::Ambiguous(tied) => {
                    announcer.announce(format!(
                        "Did you mean {}? Please try again.",
                        tied.join(" or ")
                    ));
                }
                Resolution::NoMatch => {
                    announcer
                        .announce("No match found for the candidate. Please try again.".into());
                }
            }
            debug!(
                "Transcript '{}' from voter {} did not resolve",
                transcript, self.voter.id
            );
            self.enter(SessionState::Retry { attempt });
        }

        announcer.announce("Too many attempts. Voting has been cancelled.".to_string());
        Ok(AssistOutcome::Abandoned)
    }

    async fn gesture(
        &mut self,
        candidates: &[String],
        announcer: &mut dyn Announcer,
    ) -> Result<AssistOutcome> {
        self.enter(SessionState::GestureCapture);
        let mut instructions = "Hand detection started.".to_string();
        for (index, candidate) in candidates.iter().enumerate() {
            instructions.push_str(&format!(" To vote for {candidate}, show {}.", index + 1));
        }
        announcer.announce(instructions);

        let gesture = self.collaborators.gesture;
        let raw = match self.bounded(gesture.detect()).await {
            Ok(Some(raw)) => raw,
            Ok(None) | Err(CaptureError::Unrecognised) => {
                announcer.announce("No hand gesture detected. Please try again.".to_string());
                return Ok(AssistOutcome::NoGesture);
            }
            Err(err) => {
                announcer.announce("Error during voting process. Please try again.".into());
                return Err(collaborator_error("gesture", err));
            }
        };

        self.enter(SessionState::Resolving);
        match self.collaborators.gesture_resolver.resolve(&raw, candidates) {
            Resolution::Match(candidate) => self.cast(candidate, announcer).await,
            _ => {
                announcer.announce(format!(
                    "Invalid gesture. Only {} candidates available.",
                    candidates.len()
                ));
                Ok(AssistOutcome::InvalidGesture { code: raw })
            }
        }
    }

    /// Cast exactly once for the resolved candidate.
    async fn cast(
        &mut self,
        candidate: String,
        announcer: &mut dyn Announcer,
    ) -> Result<AssistOutcome> {
        self.enter(SessionState::CastPending {
            candidate: candidate.clone(),
        });
        match self.ledger.cast(&self.voter, &candidate).await {
            Ok(receipt) => {
                announcer.announce(format!("You voted for {candidate}. Thank you."));
                self.enter(SessionState::Done);
                Ok(AssistOutcome::Voted { receipt })
            }
            Err(err) => {
                announcer.announce(
                    "Failed to complete the voting process. Please try again.".to_string(),
                );
                Err(err)
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, CaptureError>>,
    ) -> std::result::Result<T, CaptureError> {
        match timeout(self.limits.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::Unavailable(format!(
                "no answer within {}s",
                self.limits.call_timeout.as_secs_f32()
            ))),
        }
    }
}

fn collaborator_error(service: &str, err: CaptureError) -> Error {
    Error::Collaborator(format!("{service}: {err}"))
}

/// Tracks which voters have an assisted session in flight on this server.
#[derive(Default)]
pub struct AssistGuard {
    in_flight: DashMap<VoterId, ()>,
}

impl AssistGuard {
    /// Claim the voter's slot until the returned token is dropped.
    pub fn claim(&self, voter: VoterId) -> Result<InFlight<'_>> {
        match self.in_flight.entry(voter) {
            Entry::Occupied(_) => Err(Error::SessionBusy(voter)),
            Entry::Vacant(entry) => {
                entry.insert(());
                Ok(InFlight { guard: self, voter })
            }
        }
    }
}

/// A claimed in-flight slot, released on drop.
pub struct InFlight<'a> {
    guard: &'a AssistGuard,
    voter: VoterId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.guard.in_flight.remove(&self.voter);
    }
}
