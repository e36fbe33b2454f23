// SPDX-FileCopyrightText: 2026 prism-proxy contributors
//
// SPDX-License-Identifier: ISC

//! Error taxonomy shared by every proxy component.
//!
//! Per-connection errors terminate only the connection that produced them;
//! the pipeline turns each into a synthesized error response and a recorded
//! transaction outcome. `Ca` is fatal at startup only.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The inbound (client-facing) TLS handshake failed.
    #[error("inbound handshake failed: {0}")]
    Handshake(String),

    /// The outbound TLS handshake to the real origin failed.
    #[error("upstream TLS failure: {0}")]
    UpstreamTls(String),

    /// A request or response violated HTTP/1.1 framing.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The origin could not be reached, or did not answer in time.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Root key material could not be loaded or a leaf could not be signed.
    #[error("certificate authority failure: {0}")]
    Ca(String),

    /// A rule transform tried to alter framing the codec owns.
    #[error("rule transform rejected: {0}")]
    RuleEvaluation(String),

    /// A well-formed body exceeded the configured buffering limit. A policy
    /// rejection, not a framing violation.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Stable name recorded in `Outcome::Failed`, visible to the front-end.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Handshake(_) => "HandshakeError",
            ProxyError::UpstreamTls(_) => "UpstreamTLSError",
            ProxyError::MalformedMessage(_) => "MalformedMessageError",
            ProxyError::UpstreamUnavailable(_) => "UpstreamUnavailableError",
            ProxyError::Ca(_) => "CAError",
            ProxyError::RuleEvaluation(_) => "RuleEvaluationError",
            ProxyError::PayloadTooLarge(_) => "PayloadTooLargeError",
            ProxyError::Io(_) => "IoError",
        }
    }

    /// Status code of the response synthesized for the client when this
    /// error aborts a transaction.
    pub fn synthesized_status(&self) -> u16 {
        match self {
            ProxyError::MalformedMessage(_) => 400,
            ProxyError::PayloadTooLarge(_) => 413,
            ProxyError::RuleEvaluation(_) => 500,
            ProxyError::Ca(_) => 500,
            ProxyError::Io(_) => 500,
            ProxyError::Handshake(_)
            | ProxyError::UpstreamTls(_)
            | ProxyError::UpstreamUnavailable(_) => 502,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ProxyError::Handshake("x".into()), "HandshakeError", 502)]
    #[case(ProxyError::UpstreamTls("x".into()), "UpstreamTLSError", 502)]
    #[case(ProxyError::MalformedMessage("x".into()), "MalformedMessageError", 400)]
    #[case(ProxyError::UpstreamUnavailable("x".into()), "UpstreamUnavailableError", 502)]
    #[case(ProxyError::Ca("x".into()), "CAError", 500)]
    #[case(ProxyError::RuleEvaluation("x".into()), "RuleEvaluationError", 500)]
    #[case(ProxyError::PayloadTooLarge("x".into()), "PayloadTooLargeError", 413)]
    fn kinds_and_statuses(#[case] err: ProxyError, #[case] kind: &str, #[case] status: u16) {
        assert_eq!(err.kind(), kind);
        assert_eq!(err.synthesized_status(), status);
    }

    #[test]
    fn io_errors_convert() {
        let err: ProxyError = std::io::Error::other("boom").into();
        assert_eq!(err.kind(), "IoError");
        assert!(err.to_string().contains("boom"));
    }
}
