use repeater_bus::BusError;
use repeater_protocol::{Protocol, RepeaterRegisteringError};

/// Errors surfaced by the repeater lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum RepeaterError {
    #[error("repeater is already active")]
    AlreadyActive,

    #[error("another repeater with this id is already connected")]
    Busy,

    #[error("repeater is not known to the backend")]
    NotFound,

    #[error("repeater is disabled on the backend")]
    NotActive,

    #[error("repeater version is no longer supported, upgrade required")]
    RequiresUpgrade,

    #[error("no runner for protocol `{0}`")]
    UnsupportedProtocol(Protocol),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("registration returned no reply")]
    EmptyReply,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<RepeaterRegisteringError> for RepeaterError {
    fn from(err: RepeaterRegisteringError) -> Self {
        match err {
            RepeaterRegisteringError::Busy => Self::Busy,
            RepeaterRegisteringError::NotActive => Self::NotActive,
            RepeaterRegisteringError::NotFound => Self::NotFound,
            RepeaterRegisteringError::RequiresToBeUpdated => Self::RequiresUpgrade,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_errors_map_to_categories() {
        assert!(matches!(
            RepeaterError::from(RepeaterRegisteringError::Busy),
            RepeaterError::Busy
        ));
        assert!(matches!(
            RepeaterError::from(RepeaterRegisteringError::NotActive),
            RepeaterError::NotActive
        ));
        assert!(matches!(
            RepeaterError::from(RepeaterRegisteringError::NotFound),
            RepeaterError::NotFound
        ));
        assert!(matches!(
            RepeaterError::from(RepeaterRegisteringError::RequiresToBeUpdated),
            RepeaterError::RequiresUpgrade
        ));
    }

    #[test]
    fn unsupported_protocol_names_the_protocol() {
        let err = RepeaterError::UnsupportedProtocol(Protocol::Ws);
        assert_eq!(err.to_string(), "no runner for protocol `ws`");
    }
}
