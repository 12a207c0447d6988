//! `?batch=true[&commit=true]` on `POST .../storage/{collection}` (SPEC_FULL.md §4.1 supplement).

use actix_web::{
    dev::Payload,
    web::{Data, Query},
    Error, FromRequest, HttpRequest,
};
use futures::future::{FutureExt, LocalBoxFuture};
use serde::Deserialize;
use validator::Validate;

use super::validation::validate_qs_commit;
use crate::{
    error::{ApiError, ApiErrorKind, ErrorCode},
    server::ServerState,
    web::{
        error::{RequestErrorLocation, ValidationError},
        transaction::DbTransactionPool,
    },
};

#[derive(Clone, Debug, Default, Deserialize, Validate)]
#[serde(default)]
struct BatchParams {
    batch: Option<String>,
    #[validate(custom(function = "validate_qs_commit"))]
    commit: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct BatchRequest {
    /// `None` means "create a new batch"; `batch=true` is equivalent to omitting an id.
    pub id: Option<String>,
    pub commit: bool,
}

#[derive(Clone, Debug, Default)]
pub struct BatchRequestOpt {
    pub opt: Option<BatchRequest>,
}

fn bad_request(message: &str) -> ApiError {
    ApiErrorKind::Validation(ValidationError::from_details(
        message.to_owned(),
        ErrorCode::InvalidProtocol,
        RequestErrorLocation::QueryString,
        Some("batch".to_owned()),
    ))
    .into()
}

impl FromRequest for BatchRequestOpt {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        let pool_fut = DbTransactionPool::from_request(&req, payload);
        let limits = req
            .app_data::<Data<ServerState>>()
            .map(|state| state.limits.clone());

        async move {
            let params = Query::<BatchParams>::from_query(req.query_string())
                .map(|q| q.into_inner())
                .map_err(|_| bad_request("Invalid batch query string"))?;
            params
                .validate()
                .map_err(|_| bad_request("commit must be true"))?;

            if params.batch.is_none() && params.commit.is_none() {
                return Ok(BatchRequestOpt { opt: None });
            }

            if let Some(limits) = &limits {
                let header_limit = |name: &str, cap: u32| -> Result<(), ApiError> {
                    if let Some(value) = req.headers().get(name) {
                        if let Ok(value) = value.to_str().unwrap_or_default().parse::<u32>() {
                            if value > cap {
                                return Err(bad_request(&format!("{} exceeds limit", name)));
                            }
                        }
                    }
                    Ok(())
                };
                header_limit(syncstore_common::X_WEAVE_RECORDS, limits.max_post_records)?;
                header_limit(syncstore_common::X_WEAVE_BYTES, limits.max_post_bytes)?;
                header_limit(
                    syncstore_common::X_WEAVE_TOTAL_RECORDS,
                    limits.max_total_records,
                )?;
                header_limit(syncstore_common::X_WEAVE_TOTAL_BYTES, limits.max_total_bytes)?;
            }

            let commit = params
                .commit
                .as_deref()
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);

            let id = match params.batch.as_deref() {
                None | Some("true") | Some("") => None,
                Some(raw) => {
                    let pool = pool_fut.await?;
                    pool.get_pool()
                        .validate_batch_id(raw.to_owned())
                        .map_err(|_| bad_request("Invalid batch id"))?;
                    Some(raw.to_owned())
                }
            };

            Ok(BatchRequestOpt {
                opt: Some(BatchRequest { id, commit }),
            })
        }
        .boxed_local()
    }
}
