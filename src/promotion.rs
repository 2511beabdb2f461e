//! Promotion of a standby to primary.
//!
//! The identity record is the only authority. The legacy credential file
//! that older observers read is mirrored after the record is written, and
//! a failure there is logged, not returned.

use crate::credential::{self, Credential};
use crate::error::FleetError;
use crate::health::{self, HealthAssessment, PrimaryProbe};
use crate::identity::{IdentityRecord, IdentityStore};
use std::path::PathBuf;

/// Result of a promotion attempt. The two refusals are normal outcomes.
#[derive(Debug, Clone)]
pub enum PromotionOutcome {
    /// The record now names the caller as primary.
    Promoted(IdentityRecord),
    /// The primary passed its checks at confirmation time.
    PrimaryHealthy(HealthAssessment),
    /// The caller is already the recorded primary.
    AlreadyPrimary,
}

impl PromotionOutcome {
    pub fn is_promoted(&self) -> bool {
        matches!(self, Self::Promoted(_))
    }

    /// Reply shown to the operator who asked for the promotion.
    pub fn describe(&self) -> String {
        match self {
            Self::Promoted(record) => format!(
                "Promoted {} to primary. This bot now serves as the primary; keep the old \
                 primary stopped. To move the primary seat onto this credential, stop this \
                 standby first, then restart the primary seat.",
                record.active_credential
            ),
            Self::PrimaryHealthy(a) => {
                format!("No action needed: the primary is healthy ({}).", a.detail)
            }
            Self::AlreadyPrimary => "This bot is already the primary.".into(),
        }
    }
}

pub struct Promoter {
    identity: IdentityStore,
    legacy_file: Option<PathBuf>,
    static_primary: Option<Credential>,
}

impl Promoter {
    pub fn new(
        identity: IdentityStore,
        legacy_file: Option<PathBuf>,
        static_primary: Option<Credential>,
    ) -> Self {
        Self {
            identity,
            legacy_file,
            static_primary,
        }
    }

    /// Promote `credential` unless the primary has recovered.
    ///
    /// The primary is re-checked here rather than trusting an earlier
    /// assessment; only a `healthy` verdict blocks the promotion.
    pub async fn promote<P: PrimaryProbe + ?Sized>(
        &self,
        credential: &Credential,
        probe: &P,
    ) -> Result<PromotionOutcome, FleetError> {
        let current = self.identity.read();
        let already = match &current {
            Some(record) => record.names_primary(credential),
            None => self.static_primary.as_ref() == Some(credential),
        };
        if already {
            return Ok(PromotionOutcome::AlreadyPrimary);
        }

        let assessment = health::assess(probe).await;
        if assessment.is_healthy() {
            tracing::info!("promotion refused: {}", assessment.summary());
            return Ok(PromotionOutcome::PrimaryHealthy(assessment));
        }

        let predecessor = match current {
            Some(record) if record.is_primary => Some(record.active_credential),
            _ => self.static_primary.clone(),
        };
        let record = IdentityRecord::promoted(credential.clone(), predecessor);
        self.identity.write(&record)?;
        tracing::warn!(
            new_primary = %credential,
            previous = ?record.predecessor_credential,
            "promotion recorded after {}",
            assessment.summary()
        );

        if let Some(legacy) = &self.legacy_file
            && let Err(e) = credential::write_credential_file(legacy, credential)
        {
            tracing::warn!("legacy credential mirror not updated: {e}");
        }

        Ok(PromotionOutcome::Promoted(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ApiCheck;
    use crate::process::ProbeOutcome;
    use async_trait::async_trait;

    struct FixedProbe(ProbeOutcome);

    #[async_trait]
    impl PrimaryProbe for FixedProbe {
        async fn supervisor_check(&self) -> ProbeOutcome {
            self.0.clone()
        }
        async fn process_check(&self) -> ProbeOutcome {
            ProbeOutcome::Up("pid 1".into())
        }
        async fn api_check(&self) -> ApiCheck {
            ApiCheck::Ok {
                username: None,
                response_time: std::time::Duration::from_millis(5),
            }
        }
    }

    fn cred(id: &str, fill: char) -> Credential {
        Credential::parse(&format!("{id}:{}", fill.to_string().repeat(40))).unwrap()
    }

    #[tokio::test]
    async fn refuses_when_primary_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("identity.json"));
        let promoter = Promoter::new(store.clone(), None, Some(cred("1", 'A')));

        let outcome = promoter
            .promote(&cred("2", 'B'), &FixedProbe(ProbeOutcome::Up("active".into())))
            .await
            .unwrap();
        assert!(matches!(outcome, PromotionOutcome::PrimaryHealthy(_)));
        assert!(store.read().is_none());
    }

    #[tokio::test]
    async fn promotes_and_mirrors_legacy_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("identity.json"));
        let legacy = dir.path().join("main.credential");
        let original = cred("1", 'A');
        let promoter = Promoter::new(store.clone(), Some(legacy.clone()), Some(original.clone()));

        let standby = cred("2", 'B');
        let outcome = promoter
            .promote(&standby, &FixedProbe(ProbeOutcome::Down("inactive".into())))
            .await
            .unwrap();
        assert!(outcome.is_promoted());

        let record = store.read().unwrap();
        assert!(record.names_primary(&standby));
        assert_eq!(record.predecessor_credential, Some(original));
        assert_eq!(
            std::fs::read_to_string(&legacy).unwrap(),
            standby.expose()
        );
    }

    #[tokio::test]
    async fn second_promotion_is_already_primary() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("identity.json"));
        let promoter = Promoter::new(store.clone(), None, Some(cred("1", 'A')));
        let standby = cred("2", 'B');
        let down = FixedProbe(ProbeOutcome::Down("inactive".into()));

        assert!(promoter.promote(&standby, &down).await.unwrap().is_promoted());
        let before = std::fs::read(store.path()).unwrap();

        let again = promoter.promote(&standby, &down).await.unwrap();
        assert!(matches!(again, PromotionOutcome::AlreadyPrimary));
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn legacy_mirror_failure_does_not_fail_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("identity.json"));
        let legacy = dir.path().join("missing").join("main.credential");
        let promoter = Promoter::new(store.clone(), Some(legacy), None);

        let outcome = promoter
            .promote(&cred("2", 'B'), &FixedProbe(ProbeOutcome::Down("inactive".into())))
            .await
            .unwrap();
        assert!(outcome.is_promoted());
        assert!(store.read().is_some());
    }
}
