use crate::error::{Error, Result};
use crate::model::{
    auth::Identity,
    poll::{Poll, PollSnapshot, PollSpec, PollState, Tally},
    store::Storage,
};

/// Lifecycle and read access for the single active poll.
#[derive(Clone)]
pub struct PollRegistry {
    storage: Storage,
}

impl PollRegistry {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Current lifecycle state. No poll at all reads as not started.
    pub async fn state(&self) -> Result<PollState> {
        Ok(self
            .storage
            .poll()
            .await?
            .map(|poll| poll.state)
            .unwrap_or(PollState::NotStarted))
    }

    /// The active poll, if one has been created.
    pub async fn poll(&self) -> Result<Option<Poll>> {
        self.storage.poll().await
    }

    /// The active poll with its live tally.
    pub async fn snapshot(&self) -> Result<PollSnapshot> {
        let poll = match self.storage.poll().await? {
            Some(poll) => poll,
            None => {
                return Ok(PollSnapshot {
                    title: String::new(),
                    description: String::new(),
                    candidates: Vec::new(),
                    votes: Tally::default(),
                })
            }
        };
        let totals = self.storage.totals(poll.id).await?;
        let votes = Tally::for_candidates(&poll.spec.candidates, &totals);
        Ok(PollSnapshot {
            title: poll.spec.title,
            description: poll.spec.description,
            candidates: poll.spec.candidates,
            votes,
        })
    }

    /// Replace the active poll with a fresh, not-started one.
    /// Refused while the current poll is running.
    pub async fn create(&self, actor: &Identity, spec: PollSpec) -> Result<Poll> {
        require_admin(actor)?;
        let spec = spec.validate()?;
        let poll = self.storage.replace_poll(spec).await?;
        info!(
            "Admin {} created poll {} '{}' with {} candidates",
            actor.id,
            poll.id,
            poll.spec.title,
            poll.spec.candidates.len()
        );
        Ok(poll)
    }

    /// Open the poll for voting.
    ///
    /// Before any poll is created this, like [`Self::finish`], is refused as an
    /// [`Error::InvalidTransition`] out of the not-started state.
    pub async fn start(&self, actor: &Identity) -> Result<PollState> {
        self.advance(actor, PollState::NotStarted).await
    }

    /// Close the poll for good.
    pub async fn finish(&self, actor: &Identity) -> Result<PollState> {
        self.advance(actor, PollState::Running).await
    }

    async fn advance(&self, actor: &Identity, from: PollState) -> Result<PollState> {
        require_admin(actor)?;
        // `from` always has a successor here; finished is never passed in.
        let to = from.successor().unwrap_or(from);
        if !self.storage.transition_poll(from, to).await? {
            let current = self.state().await?;
            return Err(Error::InvalidTransition { from: current, to });
        }
        info!("Admin {} moved the poll from {from} to {to}", actor.id);
        Ok(to)
    }
}

fn require_admin(actor: &Identity) -> Result<()> {
    if actor.admin {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "voter {} is not an administrator",
            actor.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use rocket::local::asynchronous::Client;

    use super::*;

    #[backend_test]
    async fn lifecycle_is_monotonic(_client: Client, storage: Storage) {
        let registry = PollRegistry::new(storage);
        let admin = Identity::example_admin();

        assert_eq!(registry.state().await.unwrap(), PollState::NotStarted);
        // Nothing to start or finish before a poll is created.
        assert!(matches!(
            registry.start(&admin).await,
            Err(Error::InvalidTransition {
                from: PollState::NotStarted,
                to: PollState::Running
            })
        ));
        assert!(matches!(
            registry.finish(&admin).await,
            Err(Error::InvalidTransition {
                from: PollState::NotStarted,
                to: PollState::Finished
            })
        ));

        registry.create(&admin, PollSpec::example()).await.unwrap();
        assert!(matches!(
            registry.finish(&admin).await,
            Err(Error::InvalidTransition {
                from: PollState::NotStarted,
                to: PollState::Finished
            })
        ));

        assert_eq!(registry.start(&admin).await.unwrap(), PollState::Running);
        assert!(matches!(
            registry.start(&admin).await,
            Err(Error::InvalidTransition {
                from: PollState::Running,
                ..
            })
        ));
        // A running poll cannot be replaced.
        assert!(matches!(
            registry.create(&admin, PollSpec::example()).await,
            Err(Error::InvalidTransition { .. })
        ));

        assert_eq!(registry.finish(&admin).await.unwrap(), PollState::Finished);
        assert!(registry.start(&admin).await.is_err());
        assert!(registry.finish(&admin).await.is_err());
        assert_eq!(registry.state().await.unwrap(), PollState::Finished);
    }

    #[backend_test]
    async fn transitions_are_admin_only(_client: Client, storage: Storage) {
        let registry = PollRegistry::new(storage);
        let voter = Identity::example(2);

        assert!(matches!(
            registry.create(&voter, PollSpec::example()).await,
            Err(Error::Forbidden(_))
        ));
        registry
            .create(&Identity::example_admin(), PollSpec::example())
            .await
            .unwrap();
        assert!(matches!(
            registry.start(&voter).await,
            Err(Error::Forbidden(_))
        ));
        assert_eq!(registry.state().await.unwrap(), PollState::NotStarted);
    }

    #[backend_test]
    async fn snapshot_lists_candidates_in_order(_client: Client, storage: Storage) {
        let registry = PollRegistry::new(storage);
        let empty = registry.snapshot().await.unwrap();
        assert!(empty.candidates.is_empty());

        let spec = PollSpec {
            candidates: vec!["Zed".into(), "Alice".into(), "Bob".into()],
            ..PollSpec::example()
        };
        registry
            .create(&Identity::example_admin(), spec)
            .await
            .unwrap();
        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot.title, PollSpec::example().title);
        assert_eq!(snapshot.candidates, vec!["Zed", "Alice", "Bob"]);
        let order: Vec<_> = snapshot.votes.iter().map(|(name, _)| name).collect();
        assert_eq!(order, vec!["Zed", "Alice", "Bob"]);
    }
}
