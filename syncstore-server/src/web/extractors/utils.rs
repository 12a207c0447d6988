use std::str::FromStr;

use actix_web::{
    http::header::{Accept, Header, QualityItem},
    HttpRequest,
};
use mime::STAR_STAR;

use crate::error::ApiError;

pub fn urldecode(s: &str) -> Result<String, ApiError> {
    let decoded = urlencoding::decode(s)
        .map_err(|e| ApiError::internal(e.to_string()))?
        .into_owned();
    Ok(decoded)
}

/// Picks the response content type per spec.md §6's negotiation rule: the first accepted type
/// listed, falling back to the highest-weighted non-wildcard type, or `default`.
pub fn get_accepted(req: &HttpRequest, accepted: &[&str], default: &'static str) -> String {
    let mut candidates = Accept::parse(req).unwrap_or_else(|_| {
        Accept(vec![QualityItem::max(
            mime::Mime::from_str(default).expect("default accept type must parse"),
        )])
    });
    if candidates.is_empty() {
        return default.to_owned();
    }
    candidates.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for qitem in candidates.iter().cloned() {
        if qitem.item == STAR_STAR {
            return default.to_owned();
        }
        let lc = qitem.item.to_string().to_lowercase();
        if accepted.contains(&lc.as_str()) {
            return lc;
        }
    }
    default.to_owned()
}
