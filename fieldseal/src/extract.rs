//! Bounded, validated extraction of a sensitive value from free text.
//!
//! The extraction collaborator (typically a language model) gives no format
//! guarantee. The controller calls it at most `max_attempts` times, checking
//! each trimmed candidate with a caller-supplied predicate, and reports
//! exhaustion or cancellation as a value rather than an error.

use crate::error::Error;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Payment card number in dashed groups of four.
pub const CARD_NUMBER_PATTERN: &str = r"^\d{4}-\d{4}-\d{4}-\d{4}$";

/// Errors reported by an extraction collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
    /// Collaborator could not be reached
    #[error("extractor unavailable: {0}")]
    Unavailable(String),

    /// Collaborator answered with something unusable
    #[error("invalid extractor response: {0}")]
    InvalidResponse(String),
}

/// Turns free text into a candidate value. No output format is guaranteed.
#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    /// Extracts a candidate value from `input`.
    ///
    /// # Errors
    ///
    /// Returns `ExtractorError` if the collaborator fails; the controller
    /// counts that as a rejected attempt.
    async fn extract(&self, input: &str) -> Result<String, ExtractorError>;
}

/// Pure predicate deciding whether a candidate is acceptable.
pub trait Validator: Send + Sync {
    /// Returns `true` if `candidate` has the expected format.
    fn is_valid(&self, candidate: &str) -> bool;
}

impl<F> Validator for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_valid(&self, candidate: &str) -> bool {
        self(candidate)
    }
}

/// Full-match regular expression validator.
#[derive(Debug, Clone)]
pub struct PatternValidator {
    pattern: Regex,
}

impl PatternValidator {
    /// Compiles `pattern`, anchoring it at both ends.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the pattern does not compile.
    pub fn new(pattern: &str) -> Result<Self, Error> {
        let anchored = format!("^(?:{pattern})$");
        let pattern =
            Regex::new(&anchored).map_err(|e| Error::Config(format!("invalid validation pattern: {e}")))?;
        Ok(Self { pattern })
    }

    /// Validator for dashed 16-digit card numbers.
    #[must_use]
    pub fn card_number() -> Self {
        Self::new(CARD_NUMBER_PATTERN).expect("card number pattern is valid")
    }

    /// Trims and validates `candidate`.
    #[must_use]
    pub fn validate(&self, candidate: &str) -> Option<ValidatedSensitiveValue> {
        ValidatedSensitiveValue::check(candidate, self)
    }
}

impl Validator for PatternValidator {
    fn is_valid(&self, candidate: &str) -> bool {
        self.pattern.is_match(candidate)
    }
}

/// Raw extractor output. Never leaves the controller.
struct CandidateValue(Zeroizing<String>);

impl CandidateValue {
    fn new(raw: String) -> Self {
        Self(Zeroizing::new(raw))
    }

    fn trimmed(&self) -> &str {
        self.0.trim()
    }
}

/// A value that passed format validation. The only value the ingestion
/// path accepts for an encrypted field.
pub struct ValidatedSensitiveValue(SecretString);

impl ValidatedSensitiveValue {
    /// Trims `candidate` and wraps it if `validator` accepts it.
    #[must_use]
    pub fn check(candidate: &str, validator: &dyn Validator) -> Option<Self> {
        let trimmed = candidate.trim();
        validator.is_valid(trimmed).then(|| Self(SecretString::new(trimmed.to_owned())))
    }

    /// Returns the plaintext. Callers must not log it.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for ValidatedSensitiveValue {
    fn clone(&self) -> Self {
        Self(SecretString::new(self.expose().to_owned()))
    }
}

impl PartialEq for ValidatedSensitiveValue {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl fmt::Debug for ValidatedSensitiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValidatedSensitiveValue([REDACTED])")
    }
}

impl fmt::Display for ValidatedSensitiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Retry bounds for one extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionPolicy {
    max_attempts: u32,
    attempt_timeout: Duration,
    retry_delay: Duration,
}

impl ExtractionPolicy {
    /// Allows up to `max_attempts` extractor calls.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `max_attempts` is zero.
    pub fn new(max_attempts: u32) -> Result<Self, Error> {
        if max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        Ok(Self { max_attempts, attempt_timeout: Duration::from_secs(60), retry_delay: Duration::ZERO })
    }

    /// Bounds each extractor call; an elapsed call is a rejected attempt.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Waits this long between a rejection and the next attempt.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Returns the attempt bound.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the per-attempt timeout.
    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Returns the delay between attempts.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

impl Default for ExtractionPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, attempt_timeout: Duration::from_secs(60), retry_delay: Duration::ZERO }
    }
}

/// Cooperative cancellation, checked before each attempt.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationFlag {
    /// Creates a flag that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also treats the flag as cancelled once `deadline` passes.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Cancels every clone of this flag.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once cancelled or past the deadline.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Why an extraction produced no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Every allowed attempt was rejected
    Exhausted,
    /// Cancelled or past the deadline before an attempt
    Cancelled,
}

/// Terminal failure of an extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionFailed {
    /// Extractor calls made
    pub attempts: u32,
    /// Why no value was produced
    pub reason: FailureReason,
}

impl fmt::Display for ExtractionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            FailureReason::Exhausted => {
                write!(f, "no valid value after {} attempt(s)", self.attempts)
            }
            FailureReason::Cancelled => {
                write!(f, "extraction cancelled after {} attempt(s)", self.attempts)
            }
        }
    }
}

/// Result of [`ExtractionController::extract_validated`].
#[derive(Debug)]
pub enum ExtractionOutcome {
    /// A candidate passed validation
    Validated {
        /// The accepted value
        value: ValidatedSensitiveValue,
        /// Extractor calls made, including the successful one
        attempts: u32,
    },
    /// No candidate passed
    Failed(ExtractionFailed),
}

impl ExtractionOutcome {
    /// Returns the value if validation succeeded.
    #[must_use]
    pub fn validated(self) -> Option<ValidatedSensitiveValue> {
        match self {
            Self::Validated { value, .. } => Some(value),
            Self::Failed(_) => None,
        }
    }

    /// Returns the number of extractor calls made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Validated { attempts, .. } => *attempts,
            Self::Failed(failed) => failed.attempts,
        }
    }
}

/// Extraction progress. `attempt` is the 1-based number of the current or
/// last extractor call.
enum ExtractionState {
    Pending { attempt: u32 },
    Candidate { attempt: u32, value: CandidateValue },
    Rejected { attempt: u32 },
    Validated { attempt: u32, value: ValidatedSensitiveValue },
    Failed(ExtractionFailed),
}

impl ExtractionState {
    const fn start() -> Self {
        Self::Pending { attempt: 1 }
    }

    /// Validates a candidate; the only transition out of `Candidate`.
    fn judge(attempt: u32, value: &CandidateValue, validator: &dyn Validator) -> Self {
        match ValidatedSensitiveValue::check(value.trimmed(), validator) {
            Some(value) => Self::Validated { attempt, value },
            None => Self::Rejected { attempt },
        }
    }

    /// Leaves `Rejected`: either another attempt or exhaustion.
    const fn after_rejection(attempt: u32, policy: &ExtractionPolicy) -> Self {
        if attempt >= policy.max_attempts {
            Self::Failed(ExtractionFailed { attempts: attempt, reason: FailureReason::Exhausted })
        } else {
            Self::Pending { attempt: attempt + 1 }
        }
    }
}

/// Drives an [`Extractor`] under an [`ExtractionPolicy`].
#[derive(Clone)]
pub struct ExtractionController {
    extractor: Arc<dyn Extractor>,
}

impl fmt::Debug for ExtractionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionController").finish_non_exhaustive()
    }
}

impl ExtractionController {
    /// Creates a controller around `extractor`.
    #[must_use]
    pub fn new(extractor: Arc<dyn Extractor>) -> Self {
        Self { extractor }
    }

    /// Extracts a value from `input`, retrying until `validator` accepts a
    /// candidate or the policy is exhausted.
    pub async fn extract_validated(
        &self,
        input: &str,
        policy: &ExtractionPolicy,
        validator: &dyn Validator,
    ) -> ExtractionOutcome {
        self.extract_validated_until(input, policy, validator, &CancellationFlag::new()).await
    }

    /// Like [`ExtractionController::extract_validated`], stopping before the
    /// next attempt once `cancel` fires. An attempt in flight is never
    /// interrupted by cancellation.
    pub async fn extract_validated_until(
        &self,
        input: &str,
        policy: &ExtractionPolicy,
        validator: &dyn Validator,
        cancel: &CancellationFlag,
    ) -> ExtractionOutcome {
        let mut state = ExtractionState::start();
        loop {
            state = match state {
                ExtractionState::Pending { attempt } => {
                    if cancel.is_cancelled() {
                        ExtractionState::Failed(ExtractionFailed {
                            attempts: attempt - 1,
                            reason: FailureReason::Cancelled,
                        })
                    } else {
                        self.attempt(input, attempt, policy)
                            .await
                            .map_or(ExtractionState::Rejected { attempt }, |value| {
                                ExtractionState::Candidate { attempt, value }
                            })
                    }
                }
                ExtractionState::Candidate { attempt, value } => {
                    ExtractionState::judge(attempt, &value, validator)
                }
                ExtractionState::Rejected { attempt } => {
                    debug!(attempt, max_attempts = policy.max_attempts, "candidate rejected");
                    let next = ExtractionState::after_rejection(attempt, policy);
                    if matches!(next, ExtractionState::Pending { .. }) && !policy.retry_delay.is_zero() {
                        tokio::time::sleep(policy.retry_delay).await;
                    }
                    next
                }
                ExtractionState::Validated { attempt, value } => {
                    info!(attempts = attempt, "extracted value passed validation");
                    return ExtractionOutcome::Validated { value, attempts: attempt };
                }
                ExtractionState::Failed(failed) => {
                    warn!(attempts = failed.attempts, reason = ?failed.reason, "extraction failed");
                    return ExtractionOutcome::Failed(failed);
                }
            };
        }
    }

    async fn attempt(&self, input: &str, attempt: u32, policy: &ExtractionPolicy) -> Option<CandidateValue> {
        match tokio::time::timeout(policy.attempt_timeout, self.extractor.extract(input)).await {
            Ok(Ok(raw)) => {
                debug!(attempt, candidate_len = raw.len(), "extractor returned candidate");
                Some(CandidateValue::new(raw))
            }
            Ok(Err(err)) => {
                warn!(attempt, error = %err, "extractor failed");
                None
            }
            Err(_) => {
                warn!(attempt, timeout_ms = policy.attempt_timeout.as_millis(), "extractor timed out");
                None
            }
        }
    }
}
