use validator::ValidationError;

use super::constants::{BSO_MAX_SORTINDEX_VALUE, BSO_MAX_TTL, BSO_MIN_SORTINDEX_VALUE, VALID_ID_REGEX};

pub fn validate_body_bso_id(id: &str) -> Result<(), ValidationError> {
    if !VALID_ID_REGEX.is_match(id) {
        return Err(ValidationError::new("invalid id"));
    }
    Ok(())
}

pub fn validate_body_bso_sortindex(sort: i32) -> Result<(), ValidationError> {
    if (BSO_MIN_SORTINDEX_VALUE..=BSO_MAX_SORTINDEX_VALUE).contains(&sort) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid sortindex"))
    }
}

pub fn validate_body_bso_ttl(ttl: u32) -> Result<(), ValidationError> {
    if ttl > BSO_MAX_TTL {
        return Err(ValidationError::new("invalid ttl"));
    }
    Ok(())
}

pub fn validate_qs_ids(ids: &[String]) -> Result<(), ValidationError> {
    if ids.len() > super::constants::BATCH_MAX_IDS {
        return Err(ValidationError::new("too many ids"));
    }
    for id in ids {
        if !VALID_ID_REGEX.is_match(id) {
            return Err(ValidationError::new("invalid id in ids"));
        }
    }
    Ok(())
}

pub fn validate_qs_commit(commit: &str) -> Result<(), ValidationError> {
    if super::constants::TRUE_REGEX.is_match(commit) {
        Ok(())
    } else {
        Err(ValidationError::new("commit must be true"))
    }
}
