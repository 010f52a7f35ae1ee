use crate::fetcher::TargetState;

use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::{DateTime, SecondsFormat, Utc},
};
use kube::api::GroupVersionKind;
use retain_controller_apis::{
    ACTIVE, Condition, FollowObjectRef, RetainMode, Retainer, RetainerPhase, RetainerStatus,
    TTL_ACTIVE, reasons,
};
use std::time::Duration;

/// Requeue interval while the followed object exists.
pub(crate) const FOLLOW_CHECK_INTERVAL: Duration = Duration::from_secs(2 * 60);
/// Requeue interval while a TTL counts down.
pub(crate) const TTL_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RetainAction {
    /// Persist [`Decision::status`].
    WriteStatus,
    /// Retention ended, delete the Retainer and let the garbage collector
    /// cascade to its dependents.
    Delete { reason: String },
    Nothing,
}

/// Outcome of a mode handler.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Decision {
    pub status: RetainerStatus,
    pub action: RetainAction,
    /// `None` means do not requeue.
    pub requeue_after: Option<Duration>,
}

/// The object a Retainer follows, resolved from a valid `followObjectRef`.
pub(crate) struct TargetRef<'a> {
    pub gvk: GroupVersionKind,
    pub reference: &'a FollowObjectRef,
}

/// Returns the followed object if `mode` needs to look at it and the spec is
/// complete enough for the handler to use the result.
pub(crate) fn target_ref(retainer: &Retainer, mode: RetainMode) -> Option<TargetRef<'_>> {
    if !mode.follows_object() {
        return None;
    }
    if mode == RetainMode::FollowObjectWithTtl && !matches!(retainer.spec.ttl(), Some(Ok(_))) {
        return None;
    }
    let reference = retainer.spec.follow_object_ref.as_ref()?;
    let gvk = reference.gvk().ok()?;
    Some(TargetRef { gvk, reference })
}

/// Compute the next state of `retainer`. `target` is what [`target_ref`]
/// pointed at, `None` if it was not looked up.
pub(crate) fn decide(
    retainer: &Retainer,
    mode: RetainMode,
    target: Option<&TargetState>,
    now: DateTime<Utc>,
) -> Decision {
    match mode {
        RetainMode::FollowObject => follow_object(retainer, target, now),
        RetainMode::Ttl => ttl(retainer, now),
        RetainMode::FollowObjectWithTtl => follow_object_with_ttl(retainer, target, now),
    }
}

fn follow_object(retainer: &Retainer, target: Option<&TargetState>, now: DateTime<Utc>) -> Decision {
    let reference = match require_ref(retainer, RetainMode::FollowObject, now) {
        Ok(reference) => reference,
        Err(pending) => return pending,
    };
    if let Err(pending) = require_api_version(retainer, reference, now) {
        return pending;
    }
    match target {
        Some(TargetState::Found { uid }) if uid == &reference.uid => tracking(retainer, reference, now),
        Some(TargetState::Found { uid }) => delete(
            retainer,
            format!(
                "followed object {} was recreated (expected UID {}, found {})",
                reference.display_name(),
                reference.uid,
                uid
            ),
        ),
        Some(TargetState::NotFound) => delete(
            retainer,
            format!(
                "followed object {} in namespace {} not found",
                reference.display_name(),
                reference.namespace
            ),
        ),
        Some(TargetState::Unavailable(_)) | None => unchanged(retainer, FOLLOW_CHECK_INTERVAL),
    }
}

fn ttl(retainer: &Retainer, now: DateTime<Utc>) -> Decision {
    let ttl = match require_ttl(retainer, RetainMode::Ttl, now) {
        Ok(ttl) => ttl,
        Err(pending) => return pending,
    };
    let Some(created) = retainer.metadata.creation_timestamp.as_ref() else {
        warn!("{} has no creationTimestamp, cannot evaluate its TTL", retainer.id());
        return unchanged(retainer, TTL_CHECK_INTERVAL);
    };
    let expires_at = deadline(created.0, ttl);
    if is_expired(expires_at, now) {
        return delete(
            retainer,
            format!("TTL {} expired at {}", humantime::format_duration(ttl), format_deadline(expires_at)),
        );
    }
    let message = format!("TTL expires at {}", format_deadline(expires_at));
    let mut status = current_status(retainer);
    status.phase = Some(RetainerPhase::WaitingTtl);
    status.message = Some(message.clone());
    status.update_condition(
        condition(retainer, ACTIVE, Some(true), reasons::TTL_ACTIVE, message),
        now,
    );
    Decision {
        status,
        action: RetainAction::WriteStatus,
        requeue_after: Some(TTL_CHECK_INTERVAL),
    }
}

fn follow_object_with_ttl(
    retainer: &Retainer,
    target: Option<&TargetState>,
    now: DateTime<Utc>,
) -> Decision {
    let mode = RetainMode::FollowObjectWithTtl;
    let reference = match require_ref(retainer, mode, now) {
        Ok(reference) => reference,
        Err(pending) => return pending,
    };
    let ttl = match require_ttl(retainer, mode, now) {
        Ok(ttl) => ttl,
        Err(pending) => return pending,
    };
    if let Err(pending) = require_api_version(retainer, reference, now) {
        return pending;
    }
    match target {
        Some(TargetState::Found { uid }) if uid == &reference.uid => {
            let mut decision = tracking(retainer, reference, now);
            // The object is back, a later loss starts a fresh countdown.
            decision.status.lost_at = None;
            decision.status.remove_condition(TTL_ACTIVE);
            decision
        }
        Some(TargetState::Found { .. }) => lost(
            retainer,
            ttl,
            "FollowObject UID mismatch; waiting for TTL expiration",
            now,
        ),
        Some(TargetState::NotFound) => lost(
            retainer,
            ttl,
            "FollowObject not found; starting TTL countdown",
            now,
        ),
        Some(TargetState::Unavailable(_)) | None => unchanged(retainer, FOLLOW_CHECK_INTERVAL),
    }
}

/// The followed object is gone (or was replaced): count down from the first
/// time the loss was observed.
fn lost(retainer: &Retainer, ttl: Duration, message: &str, now: DateTime<Utc>) -> Decision {
    let mut status = current_status(retainer);
    let lost_at = status.lost_at.as_ref().map(|t| t.0).unwrap_or(now);
    let expires_at = deadline(lost_at, ttl);
    if is_expired(expires_at, now) {
        return delete(
            retainer,
            format!(
                "followed object lost at {} and TTL {} expired at {}",
                lost_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                humantime::format_duration(ttl),
                format_deadline(expires_at)
            ),
        );
    }
    status.lost_at = Some(Time(lost_at));
    status.phase = Some(RetainerPhase::WaitingTtl);
    status.message = Some(message.to_string());
    status.update_condition(
        condition(
            retainer,
            TTL_ACTIVE,
            Some(false),
            reasons::MISSING_FOLLOW_OBJECT,
            format!("TTL expires at {}", format_deadline(expires_at)),
        ),
        now,
    );
    Decision {
        status,
        action: RetainAction::WriteStatus,
        requeue_after: Some(TTL_CHECK_INTERVAL),
    }
}

fn tracking(retainer: &Retainer, reference: &FollowObjectRef, now: DateTime<Utc>) -> Decision {
    let message = format!("Following object {}", reference.display_name());
    let mut status = current_status(retainer);
    status.phase = Some(RetainerPhase::Tracking);
    status.message = Some(message.clone());
    status.update_condition(
        condition(retainer, ACTIVE, Some(true), reasons::OBJECT_EXISTS, message),
        now,
    );
    Decision {
        status,
        action: RetainAction::WriteStatus,
        requeue_after: Some(FOLLOW_CHECK_INTERVAL),
    }
}

fn require_ref<'a>(
    retainer: &'a Retainer,
    mode: RetainMode,
    now: DateTime<Utc>,
) -> Result<&'a FollowObjectRef, Decision> {
    retainer.spec.follow_object_ref.as_ref().ok_or_else(|| {
        pending(
            retainer,
            reasons::MISSING_FOLLOW_OBJECT_REF,
            format!("FollowObjectRef is required for {} mode", mode),
            now,
        )
    })
}

fn require_api_version(
    retainer: &Retainer,
    reference: &FollowObjectRef,
    now: DateTime<Utc>,
) -> Result<(), Decision> {
    reference.gvk().map(|_| ()).map_err(|_| {
        pending(
            retainer,
            reasons::INVALID_API_VERSION,
            format!("Invalid APIVersion: {}", reference.api_version),
            now,
        )
    })
}

fn require_ttl(retainer: &Retainer, mode: RetainMode, now: DateTime<Utc>) -> Result<Duration, Decision> {
    match retainer.spec.ttl() {
        Some(Ok(ttl)) => Ok(ttl),
        Some(Err(e)) => Err(pending(
            retainer,
            reasons::INVALID_TTL,
            format!("Invalid TTL {:?}: {}", retainer.spec.ttl.as_deref().unwrap_or(""), e),
            now,
        )),
        None => Err(pending(
            retainer,
            reasons::MISSING_TTL,
            format!("TTL is required for {} mode", mode),
            now,
        )),
    }
}

fn pending(retainer: &Retainer, reason: &str, message: String, now: DateTime<Utc>) -> Decision {
    let mut status = current_status(retainer);
    status.phase = Some(RetainerPhase::Pending);
    status.message = Some(message.clone());
    status.update_condition(condition(retainer, ACTIVE, Some(false), reason, message), now);
    Decision {
        status,
        action: RetainAction::WriteStatus,
        requeue_after: None,
    }
}

fn delete(retainer: &Retainer, reason: String) -> Decision {
    Decision {
        status: current_status(retainer),
        action: RetainAction::Delete { reason },
        requeue_after: None,
    }
}

fn unchanged(retainer: &Retainer, requeue_after: Duration) -> Decision {
    Decision {
        status: current_status(retainer),
        action: RetainAction::Nothing,
        requeue_after: Some(requeue_after),
    }
}

fn current_status(retainer: &Retainer) -> RetainerStatus {
    retainer.status.clone().unwrap_or_default()
}

fn condition(
    retainer: &Retainer,
    tpe: &str,
    status: Option<bool>,
    reason: &str,
    message: String,
) -> Condition {
    Condition::new(tpe, status, reason, message).with_observed_generation(retainer.metadata.generation)
}

/// `start + ttl`, `None` if that is not representable (i.e. never).
fn deadline(start: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    k8s_openapi::chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| start.checked_add_signed(ttl))
}

/// Expiry is strict: at the exact deadline the Retainer still exists.
fn is_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.map_or(false, |expires_at| now > expires_at)
}

fn format_deadline(expires_at: Option<DateTime<Utc>>) -> String {
    expires_at
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "never".to_string())
}
