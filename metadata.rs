use serde::{Deserialize, Serialize};

use crate::error::{CdocError, Result};

/// Longest entry name the FILE frame can carry, in bytes
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

/// One entry of the payload stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, size: u64) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { name, size })
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CdocError::InvalidName("name is empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CdocError::InvalidName(format!(
            "name is {} bytes, limit is {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_checked() {
        assert!(FileInfo::new("a.txt", 3).is_ok());
        assert!(matches!(FileInfo::new("", 0), Err(CdocError::InvalidName(_))));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(FileInfo::new(long, 0), Err(CdocError::InvalidName(_))));
    }

    #[test]
    fn test_serializes_name_and_size() {
        let info = FileInfo::new("report.pdf", 1024).unwrap();
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(json, r#"{"name":"report.pdf","size":1024}"#);
    }
}
