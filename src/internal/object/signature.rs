//! Author and committer identity lines as they appear inside commit objects:
//! `author Name <email> 1700000000 +0000`.

use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::ChronError;

/// Which identity line a signature renders as.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureType {
    Author,
    Committer,
}

impl Display for SignatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SignatureType::Author => write!(f, "author"),
            SignatureType::Committer => write!(f, "committer"),
        }
    }
}

impl FromStr for SignatureType {
    type Err = ChronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "author" => Ok(SignatureType::Author),
            "committer" => Ok(SignatureType::Committer),
            _ => Err(ChronError::InvalidObject(s.to_string(), "signature")),
        }
    }
}

/// One identity line of a commit: kind, name, email, seconds since the epoch
/// and timezone offset.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub signature_type: SignatureType,
    pub name: String,
    pub email: String,
    pub timestamp: i64,
    pub timezone: String,
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} {} <{}> {} {}",
            self.signature_type, self.name, self.email, self.timestamp, self.timezone
        )
    }
}

impl Signature {
    /// Identity stamped with the current time in UTC.
    pub fn now(signature_type: SignatureType, name: &str, email: &str) -> Signature {
        Signature {
            signature_type,
            name: name.to_string(),
            email: email.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            timezone: "+0000".to_string(),
        }
    }

    /// Parse one `author`/`committer` line (without trailing newline).
    pub fn from_data(data: Vec<u8>) -> Result<Signature, ChronError> {
        let invalid =
            || ChronError::InvalidObject(String::from_utf8_lossy(&data).into_owned(), "signature");

        let kind_end = data.find_byte(b' ').ok_or_else(invalid)?;
        let signature_type =
            SignatureType::from_str(data[..kind_end].to_str().map_err(|_| invalid())?)?;

        let email_open = data.find_byte(b'<').ok_or_else(invalid)?;
        let email_close = data.find_byte(b'>').ok_or_else(invalid)?;
        if email_open <= kind_end + 1 || email_close < email_open {
            return Err(invalid());
        }
        let name = data[kind_end + 1..email_open - 1]
            .to_str()
            .map_err(|_| invalid())?
            .to_string();
        let email = data[email_open + 1..email_close]
            .to_str()
            .map_err(|_| invalid())?
            .to_string();

        let rest = data[email_close + 1..].trim();
        let mut parts = rest.splitn_str(2, b" ");
        let timestamp: i64 = parts
            .next()
            .and_then(|t| t.to_str().ok())
            .and_then(|t| t.parse().ok())
            .ok_or_else(invalid)?;
        let timezone = parts
            .next()
            .and_then(|t| t.to_str().ok())
            .unwrap_or("+0000")
            .to_string();

        Ok(Signature {
            signature_type,
            name,
            email,
            timestamp,
            timezone,
        })
    }

    pub fn to_data(&self) -> Result<Vec<u8>, ChronError> {
        Ok(self.to_string().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_author_line() {
        let sig =
            Signature::from_data(b"author benjamin <benjamin@chrondb.dev> 1757467768 +0800".to_vec())
                .unwrap();
        assert_eq!(sig.signature_type, SignatureType::Author);
        assert_eq!(sig.name, "benjamin");
        assert_eq!(sig.email, "benjamin@chrondb.dev");
        assert_eq!(sig.timestamp, 1757467768);
        assert_eq!(sig.timezone, "+0800");
    }

    #[test]
    fn test_round_trip() {
        let sig = Signature {
            signature_type: SignatureType::Committer,
            name: "chrondb".to_string(),
            email: "chrondb@localhost".to_string(),
            timestamp: 1700000000,
            timezone: "+0000".to_string(),
        };
        let data = sig.to_data().unwrap();
        assert_eq!(Signature::from_data(data).unwrap(), sig);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Signature::from_data(b"author broken-line".to_vec()).is_err());
        assert!(Signature::from_data(b"tagger a <a@b> 1 +0000".to_vec()).is_err());
    }

    #[test]
    fn test_name_with_spaces() {
        let sig = Signature::from_data(
            b"committer Ada Lovelace <ada@engine.org> 1700000001 -0300".to_vec(),
        )
        .unwrap();
        assert_eq!(sig.name, "Ada Lovelace");
        assert_eq!(sig.timezone, "-0300");
    }
}
