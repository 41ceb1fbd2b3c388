//! Alert protocol values.

use serde::{Deserialize, Serialize};
use tlscript_types::CodecError;

/// Alert severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AlertLevel {
    Warning = 1,
    Fatal = 2,
}

/// Alert description codes (RFC 8446 Section 6, plus legacy codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AlertDescription {
    CloseNotify = 0,
    UnexpectedMessage = 10,
    BadRecordMac = 20,
    DecryptionFailed = 21,
    RecordOverflow = 22,
    DecompressionFailure = 30,
    HandshakeFailure = 40,
    BadCertificate = 42,
    UnsupportedCertificate = 43,
    CertificateRevoked = 44,
    CertificateExpired = 45,
    CertificateUnknown = 46,
    IllegalParameter = 47,
    UnknownCa = 48,
    AccessDenied = 49,
    DecodeError = 50,
    DecryptError = 51,
    ProtocolVersion = 70,
    InsufficientSecurity = 71,
    InternalError = 80,
    InappropriateFallback = 86,
    UserCanceled = 90,
    NoRenegotiation = 100,
    MissingExtension = 109,
    UnsupportedExtension = 110,
    UnrecognizedName = 112,
    BadCertificateStatusResponse = 113,
    UnknownPskIdentity = 115,
    CertificateRequired = 116,
    NoApplicationProtocol = 120,
}

impl AlertLevel {
    pub fn from_u8(v: u8) -> Result<Self, u8> {
        match v {
            1 => Ok(AlertLevel::Warning),
            2 => Ok(AlertLevel::Fatal),
            _ => Err(v),
        }
    }
}

impl AlertDescription {
    pub fn from_u8(v: u8) -> Result<Self, u8> {
        use AlertDescription::*;
        Ok(match v {
            0 => CloseNotify,
            10 => UnexpectedMessage,
            20 => BadRecordMac,
            21 => DecryptionFailed,
            22 => RecordOverflow,
            30 => DecompressionFailure,
            40 => HandshakeFailure,
            42 => BadCertificate,
            43 => UnsupportedCertificate,
            44 => CertificateRevoked,
            45 => CertificateExpired,
            46 => CertificateUnknown,
            47 => IllegalParameter,
            48 => UnknownCa,
            49 => AccessDenied,
            50 => DecodeError,
            51 => DecryptError,
            70 => ProtocolVersion,
            71 => InsufficientSecurity,
            80 => InternalError,
            86 => InappropriateFallback,
            90 => UserCanceled,
            100 => NoRenegotiation,
            109 => MissingExtension,
            110 => UnsupportedExtension,
            112 => UnrecognizedName,
            113 => BadCertificateStatusResponse,
            115 => UnknownPskIdentity,
            116 => CertificateRequired,
            120 => NoApplicationProtocol,
            _ => return Err(v),
        })
    }
}

/// An alert as carried in a 2-byte alert message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: AlertDescription,
}

impl Alert {
    pub fn new(level: AlertLevel, description: AlertDescription) -> Self {
        Self { level, description }
    }

    pub fn fatal(description: AlertDescription) -> Self {
        Self::new(AlertLevel::Fatal, description)
    }

    pub fn warning(description: AlertDescription) -> Self {
        Self::new(AlertLevel::Warning, description)
    }

    pub fn is_fatal(&self) -> bool {
        self.level == AlertLevel::Fatal
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [self.level as u8, self.description as u8]
    }

    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 2 {
            return Err(CodecError::incomplete("alert", 2, data.len()));
        }
        let level = AlertLevel::from_u8(data[0]).map_err(|v| CodecError::InvalidValue {
            what: "alert level",
            value: v.into(),
        })?;
        let description =
            AlertDescription::from_u8(data[1]).map_err(|v| CodecError::InvalidValue {
                what: "alert description",
                value: v.into(),
            })?;
        Ok(Self { level, description })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_wire_values() {
        assert_eq!(AlertLevel::Fatal as u8, 2);
        assert_eq!(AlertDescription::BadRecordMac as u8, 20);
        assert_eq!(AlertDescription::NoApplicationProtocol as u8, 120);
        assert_eq!(AlertDescription::from_u8(47), Ok(AlertDescription::IllegalParameter));
        assert_eq!(AlertDescription::from_u8(200), Err(200));
        assert_eq!(AlertLevel::from_u8(3), Err(3));
    }

    #[test]
    fn test_alert_bytes() {
        let alert = Alert::fatal(AlertDescription::HandshakeFailure);
        assert!(alert.is_fatal());
        assert_eq!(alert.to_bytes(), [2, 40]);
        assert_eq!(Alert::parse(&[2, 40]).unwrap(), alert);

        let warn = Alert::parse(&[1, 0]).unwrap();
        assert_eq!(warn, Alert::warning(AlertDescription::CloseNotify));
        assert!(!warn.is_fatal());
    }

    #[test]
    fn test_alert_parse_errors() {
        assert!(Alert::parse(&[2]).unwrap_err().is_incomplete());
        assert!(Alert::parse(&[9, 40]).is_err());
        assert!(Alert::parse(&[2, 250]).is_err());
    }
}
