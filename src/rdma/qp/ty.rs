use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::bindings::*;

/// Queue pair type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QpType {
    /// Reliable connection.
    #[default]
    Rc,

    /// Unreliable datagram.
    Ud,
}

impl From<QpType> for ibv_qp_type::Type {
    fn from(qp_type: QpType) -> Self {
        match qp_type {
            QpType::Rc => ibv_qp_type::IBV_QPT_RC,
            QpType::Ud => ibv_qp_type::IBV_QPT_UD,
        }
    }
}

impl fmt::Display for QpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rc => "rc",
            Self::Ud => "ud",
        })
    }
}

/// Error parsing a [`QpType`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown QP type {0:?} (expected `rc` or `ud`)")]
pub struct ParseQpTypeError(String);

impl FromStr for QpType {
    type Err = ParseQpTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rc" => Ok(Self::Rc),
            "ud" => Ok(Self::Ud),
            _ => Err(ParseQpTypeError(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        assert_eq!("rc".parse::<QpType>(), Ok(QpType::Rc));
        assert_eq!(" UD ".parse::<QpType>(), Ok(QpType::Ud));
        assert!("uc".parse::<QpType>().is_err());
        assert_eq!(QpType::Ud.to_string(), "ud");
    }

    #[test]
    fn raw_mapping() {
        assert_eq!(ibv_qp_type::Type::from(QpType::Rc), ibv_qp_type::IBV_QPT_RC);
        assert_eq!(ibv_qp_type::Type::from(QpType::Ud), ibv_qp_type::IBV_QPT_UD);
    }
}
