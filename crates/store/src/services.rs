//! Workflows built on the stores.
//!
//! ## Services
//!
//! - **sender** - Outbound message delivery via SMTP (lettre) or log-only
//! - **otp** - One-time code issue and verification
//! - **premium** - Scheduled premium expiry and expiry warnings
//! - **interests** - Send and respond to interests, notifying the other side
//! - **reconcile** - Repair of membership sets, email lookups and photo mirrors
//!
//! Time-dependent operations take `now` explicitly so runs are reproducible.

mod interests;
mod otp;
mod premium;
mod reconcile;
mod sender;

pub use interests::InterestService;
pub use otp::{CODE_TTL_SECS, IssuedCode, OtpOutcome, OtpService};
pub use premium::{ExpiryReport, PremiumExpiryEngine, WARNING_MARKER_TTL_SECS, WARNING_THRESHOLDS};
pub use reconcile::{ReconcileReport, Reconciler};
pub use sender::{LogSender, MessageSender, OutboundMessage, SmtpSender};

#[cfg(test)]
pub use sender::MockMessageSender;
