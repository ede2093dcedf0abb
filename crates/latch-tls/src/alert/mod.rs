//! TLS alert protocol.

use latch_types::TlsError;

/// Alert severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertLevel {
    Warning = 1,
    Fatal = 2,
}

/// Alert description codes (RFC 8446 §6 / RFC 5246 §7.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertDescription {
    CloseNotify = 0,
    UnexpectedMessage = 10,
    BadRecordMac = 20,
    RecordOverflow = 22,
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

/// A TLS alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: AlertDescription,
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
        match v {
            0 => Ok(AlertDescription::CloseNotify),
            10 => Ok(AlertDescription::UnexpectedMessage),
            20 => Ok(AlertDescription::BadRecordMac),
            22 => Ok(AlertDescription::RecordOverflow),
            40 => Ok(AlertDescription::HandshakeFailure),
            42 => Ok(AlertDescription::BadCertificate),
            43 => Ok(AlertDescription::UnsupportedCertificate),
            44 => Ok(AlertDescription::CertificateRevoked),
            45 => Ok(AlertDescription::CertificateExpired),
            46 => Ok(AlertDescription::CertificateUnknown),
            47 => Ok(AlertDescription::IllegalParameter),
            48 => Ok(AlertDescription::UnknownCa),
            49 => Ok(AlertDescription::AccessDenied),
            50 => Ok(AlertDescription::DecodeError),
            51 => Ok(AlertDescription::DecryptError),
            70 => Ok(AlertDescription::ProtocolVersion),
            71 => Ok(AlertDescription::InsufficientSecurity),
            80 => Ok(AlertDescription::InternalError),
            90 => Ok(AlertDescription::UserCanceled),
            100 => Ok(AlertDescription::NoRenegotiation),
            109 => Ok(AlertDescription::MissingExtension),
            110 => Ok(AlertDescription::UnsupportedExtension),
            112 => Ok(AlertDescription::UnrecognizedName),
            113 => Ok(AlertDescription::BadCertificateStatusResponse),
            115 => Ok(AlertDescription::UnknownPskIdentity),
            116 => Ok(AlertDescription::CertificateRequired),
            120 => Ok(AlertDescription::NoApplicationProtocol),
            _ => Err(v),
        }
    }
}

impl Alert {
    /// The fatal alert an error maps to.
    pub fn from_error(err: &TlsError) -> Alert {
        let description =
            AlertDescription::from_u8(err.alert()).unwrap_or(AlertDescription::InternalError);
        Alert {
            level: AlertLevel::Fatal,
            description,
        }
    }

    /// A warning-level `close_notify`.
    pub fn close_notify() -> Alert {
        Alert {
            level: AlertLevel::Warning,
            description: AlertDescription::CloseNotify,
        }
    }

    /// Encode as the 2-byte alert record payload.
    pub fn encode(&self) -> [u8; 2] {
        [self.level as u8, self.description as u8]
    }

    /// Decode from a 2-byte alert record payload.
    pub fn decode(data: &[u8]) -> Result<Alert, TlsError> {
        if data.len() != 2 {
            return Err(TlsError::Decode("alert payload must be 2 bytes".into()));
        }
        let level = AlertLevel::from_u8(data[0])
            .map_err(|v| TlsError::Decode(format!("unknown alert level {v}")))?;
        let description = AlertDescription::from_u8(data[1])
            .map_err(|v| TlsError::Decode(format!("unknown alert description {v}")))?;
        Ok(Alert { level, description })
    }

    /// Non-fatal peer alerts are surfaced without tearing down the
    /// connection.
    pub fn is_ignorable_warning(&self) -> bool {
        self.level == AlertLevel::Warning
            && matches!(
                self.description,
                AlertDescription::UserCanceled | AlertDescription::NoRenegotiation
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_level_values() {
        assert_eq!(AlertLevel::Warning as u8, 1);
        assert_eq!(AlertLevel::Fatal as u8, 2);
    }

    #[test]
    fn test_alert_description_values() {
        assert_eq!(AlertDescription::CloseNotify as u8, 0);
        assert_eq!(AlertDescription::UnexpectedMessage as u8, 10);
        assert_eq!(AlertDescription::BadRecordMac as u8, 20);
        assert_eq!(AlertDescription::HandshakeFailure as u8, 40);
        assert_eq!(AlertDescription::IllegalParameter as u8, 47);
        assert_eq!(AlertDescription::DecodeError as u8, 50);
        assert_eq!(AlertDescription::DecryptError as u8, 51);
        assert_eq!(AlertDescription::ProtocolVersion as u8, 70);
        assert_eq!(AlertDescription::NoRenegotiation as u8, 100);
        assert_eq!(AlertDescription::MissingExtension as u8, 109);
        assert_eq!(AlertDescription::UnknownPskIdentity as u8, 115);
        assert_eq!(AlertDescription::NoApplicationProtocol as u8, 120);
    }

    #[test]
    fn test_alert_description_from_u8_roundtrip() {
        let codes: &[u8] = &[
            0, 10, 20, 22, 40, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51, 70, 71, 80, 90, 100, 109,
            110, 112, 113, 115, 116, 120,
        ];
        for &code in codes {
            let desc = AlertDescription::from_u8(code).unwrap();
            assert_eq!(desc as u8, code);
        }
        assert!(AlertDescription::from_u8(1).is_err());
        assert!(AlertDescription::from_u8(255).is_err());
    }

    #[test]
    fn test_alert_encode_decode() {
        let alert = Alert {
            level: AlertLevel::Fatal,
            description: AlertDescription::HandshakeFailure,
        };
        let bytes = alert.encode();
        assert_eq!(bytes, [2, 40]);
        assert_eq!(Alert::decode(&bytes).unwrap(), alert);

        assert!(Alert::decode(&[2]).is_err());
        assert!(Alert::decode(&[3, 40]).is_err());
        assert!(Alert::decode(&[2, 1]).is_err());
    }

    #[test]
    fn test_alert_from_error() {
        let alert = Alert::from_error(&TlsError::IllegalParameter("x".into()));
        assert_eq!(alert.level, AlertLevel::Fatal);
        assert_eq!(alert.description, AlertDescription::IllegalParameter);

        let alert = Alert::from_error(&TlsError::Internal("x".into()));
        assert_eq!(alert.description, AlertDescription::InternalError);
    }

    #[test]
    fn test_ignorable_warnings() {
        let warn = Alert {
            level: AlertLevel::Warning,
            description: AlertDescription::NoRenegotiation,
        };
        assert!(warn.is_ignorable_warning());
        let warn = Alert {
            level: AlertLevel::Warning,
            description: AlertDescription::UserCanceled,
        };
        assert!(warn.is_ignorable_warning());
        let fatal = Alert {
            level: AlertLevel::Fatal,
            description: AlertDescription::NoRenegotiation,
        };
        assert!(!fatal.is_ignorable_warning());
    }
}
