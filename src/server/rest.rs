//! actix-web handlers implementing the HTTP API table: listing indexes,
//! `match`/`count`/`query`/`all`, and continuation resumption.

use std::sync::Arc;

use actix_web::{get, head, web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use serde::Deserialize;

use crate::err::{BioIndexError, Result};
use crate::restrictions::{self, Restrictions};

use super::{AppState, Args};

fn split_q(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).map(str::to_string).collect()
}

#[derive(Deserialize)]
struct MatchQuery {
    q: String,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct CountQuery {
    q: Option<String>,
}

#[derive(Deserialize)]
struct FetchQuery {
    q: String,
    fmt: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct AllQuery {
    fmt: Option<String>,
}

#[derive(Deserialize)]
struct ContQuery {
    token: String,
}

async fn resolve_restrictions(
    state: &AppState,
    req: &HttpRequest,
    restriction_name: &str,
) -> Result<Restrictions> {
    let header = req
        .headers()
        .get(restrictions::TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    let query_param = req
        .uri()
        .query()
        .and_then(|q| web::Query::<std::collections::HashMap<String, String>>::from_query(q).ok())
        .and_then(|q| q.get(restrictions::TOKEN_QUERY_PARAM).cloned());
    let token = restrictions::extract_token(header, query_param.as_deref()).map(str::to_string);

    Restrictions::resolve(
        state.portal_pool.as_ref(),
        state.validator.as_ref(),
        restriction_name,
        token.as_deref(),
    )
    .await
}

/// `fmt=row` (default) returns records as-is; `fmt=col` transposes the page
/// into a column-major map keyed by the union of the first record's keys, per
/// spec §6. An empty page yields an empty map either way.
fn format_data(records: Vec<serde_json::Value>, fmt: Option<&str>) -> serde_json::Value {
    if fmt != Some("col") {
        return serde_json::Value::Array(records);
    }
    let Some(first) = records.first().and_then(|r| r.as_object()) else {
        return serde_json::Value::Object(Default::default());
    };
    let mut columns = serde_json::Map::new();
    for key in first.keys() {
        let values: Vec<serde_json::Value> = records
            .iter()
            .map(|r| r.get(key).cloned().unwrap_or(serde_json::Value::Null))
            .collect();
        columns.insert(key.clone(), serde_json::Value::Array(values));
    }
    serde_json::Value::Object(columns)
}

fn page_response(
    profile: &str,
    index_name: &str,
    q: &[String],
    page: &crate::reader::Page,
    page_no: u64,
    limit: usize,
    fmt: Option<&str>,
    continuation: Option<String>,
) -> HttpResponse {
    let records: Vec<serde_json::Value> = page
        .records
        .iter()
        .filter_map(|r| serde_json::from_str(r).ok())
        .collect();
    let count = records.len();

    HttpResponse::Ok().json(serde_json::json!({
        "profile": profile,
        "index": index_name,
        "q": q,
        "count": count,
        "restricted": page.restricted_count,
        "progress": {"bytes_read": page.bytes_read, "bytes_total": page.bytes_total},
        "page": page_no,
        "limit": limit,
        "data": format_data(records, fmt),
        "continuation": continuation,
        "nonce": fastrand::u64(..),
    }))
}

#[get("/api/bio/indexes")]
async fn list_indexes(state: web::Data<Arc<AppState>>) -> actix_web::Result<impl Responder, BioIndexError> {
    let indexes = crate::catalog::list_indexes(&state.pool, false).await?;
    Ok(HttpResponse::Ok().json(
        indexes
            .into_iter()
            .map(|i| {
                serde_json::json!({
                    "name": i.name,
                    "prefix": i.prefix,
                    "schema": i.schema,
                    "built": i.built,
                })
            })
            .collect::<Vec<_>>(),
    ))
}

#[get("/api/bio/match/{index}")]
async fn match_index(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    query: web::Query<MatchQuery>,
) -> actix_web::Result<impl Responder, BioIndexError> {
    let name = path.into_inner();
    let index = crate::catalog::lookup_any(&state.pool, &name)
        .await?
        .ok_or_else(|| BioIndexError::BadRequest(format!("unknown index {name:?}")))?;
    let q = split_q(&query.q);
    let limit = query.limit.unwrap_or(state.config.match_limit);

    let (keys, has_more) = crate::planner::r#match(&state.pool, &index, &q, limit, 0).await?;

    let continuation = if has_more {
        let pool = state.pool.clone();
        let index_for_cb = index.clone();
        let q_for_cb = q.clone();
        let name_for_cb = name.clone();
        let token = state
            .continuations
            .make_continuation(
                1,
                Box::new(move |page_no| {
                    let pool = pool.clone();
                    let index_for_cb = index_for_cb.clone();
                    let q_for_cb = q_for_cb.clone();
                    let name_for_cb = name_for_cb.clone();
                    Box::pin(async move {
                        let offset = page_no as usize * limit;
                        let (keys, has_more) =
                            crate::planner::r#match(&pool, &index_for_cb, &q_for_cb, limit, offset)
                                .await?;
                        let body = serde_json::json!({
                            "index": name_for_cb,
                            "q": q_for_cb,
                            "page": page_no,
                            "limit": limit,
                            "data": keys,
                        });
                        Ok((body, has_more))
                    })
                }),
            )
            .await;
        Some(token)
    } else {
        None
    };

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "index": name,
        "q": q,
        "data": keys,
        "continuation": continuation,
    })))
}

#[get("/api/bio/count/{index}")]
async fn count_index(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    query: web::Query<CountQuery>,
) -> actix_web::Result<impl Responder, BioIndexError> {
    let name = path.into_inner();
    let q = query.q.as_deref().map(split_q).unwrap_or_default();
    let index = crate::catalog::lookup_by_arity(&state.pool, &name, q.len())
        .await?
        .ok_or_else(|| BioIndexError::BadRequest(format!("unknown index {name:?}")))?;
    let n = crate::planner::count(&state.pool, &state.store, &index, &q).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"index": name, "q": q, "count": n})))
}

#[get("/api/bio/query/{index}")]
async fn query_index(
    req: HttpRequest,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    query: web::Query<FetchQuery>,
) -> actix_web::Result<impl Responder, BioIndexError> {
    let name = path.into_inner();
    let q = split_q(&query.q);
    let index = crate::catalog::lookup_by_arity(&state.pool, &name, q.len())
        .await?
        .ok_or_else(|| BioIndexError::BadRequest(format!("unknown index {name:?} with arity {}", q.len())))?;

    let restrictions = resolve_restrictions(&state, &req, &name).await?;
    let mut reader =
        crate::planner::fetch(&state.pool, &state.store, &index, &q, Some(restrictions)).await?;
    let bytes_total = reader.bytes_total();
    if bytes_total > state.config.response_limit_max {
        return Err(BioIndexError::PayloadTooLarge {
            bytes_total,
            limit: state.config.response_limit_max,
        });
    }

    let limit = query.limit.unwrap_or(state.config.match_limit);
    let page = reader.next_page(limit).await?;

    let fmt = query.fmt.clone();
    let continuation = if page.at_end {
        None
    } else {
        let q_for_cb = q.clone();
        let name_for_cb = name.clone();
        let fmt_for_cb = fmt.clone();
        let mut reader_for_cb = reader;
        let token = state
            .continuations
            .make_continuation(
                1,
                Box::new(move |page_no| {
                    let q_for_cb = q_for_cb.clone();
                    let name_for_cb = name_for_cb.clone();
                    let fmt_for_cb = fmt_for_cb.clone();
                    Box::pin(async move {
                        let pg = reader_for_cb.next_page(limit).await?;
                        let records: Vec<serde_json::Value> = pg
                            .records
                            .iter()
                            .filter_map(|r| serde_json::from_str(r).ok())
                            .collect();
                        let count = records.len();
                        let body = serde_json::json!({
                            "profile": "bio",
                            "index": name_for_cb,
                            "q": q_for_cb,
                            "count": count,
                            "restricted": pg.restricted_count,
                            "progress": {"bytes_read": pg.bytes_read, "bytes_total": pg.bytes_total},
                            "page": page_no,
                            "limit": limit,
                            "data": format_data(records, fmt_for_cb.as_deref()),
                        });
                        Ok((body, !pg.at_end))
                    })
                }),
            )
            .await;
        Some(token)
    };

    Ok(page_response(
        "bio",
        &name,
        &q,
        &page,
        0,
        limit,
        fmt.as_deref(),
        continuation,
    ))
}

#[head("/api/bio/query/{index}")]
async fn query_index_head(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    query: web::Query<FetchQuery>,
) -> actix_web::Result<impl Responder, BioIndexError> {
    let name = path.into_inner();
    let q = split_q(&query.q);
    let index = crate::catalog::lookup_by_arity(&state.pool, &name, q.len())
        .await?
        .ok_or_else(|| BioIndexError::BadRequest(format!("unknown index {name:?} with arity {}", q.len())))?;
    let reader = crate::planner::fetch(&state.pool, &state.store, &index, &q, None).await?;
    Ok(HttpResponse::Ok()
        .insert_header(("Content-Length", reader.bytes_total().to_string()))
        .finish())
}

#[get("/api/bio/all/{index}")]
async fn all_index(
    req: HttpRequest,
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    query: web::Query<AllQuery>,
) -> actix_web::Result<impl Responder, BioIndexError> {
    let name = path.into_inner();
    let index = crate::catalog::lookup_any(&state.pool, &name)
        .await?
        .ok_or_else(|| BioIndexError::BadRequest(format!("unknown index {name:?}")))?;
    let restrictions = resolve_restrictions(&state, &req, &name).await?;
    let mut reader = crate::planner::fetch_all(&state.store, &index, Some(restrictions)).await?;
    if reader.bytes_total() > state.config.response_limit_max {
        return Err(BioIndexError::PayloadTooLarge {
            bytes_total: reader.bytes_total(),
            limit: state.config.response_limit_max,
        });
    }
    let limit = state.config.match_limit;
    let page = reader.next_page(limit).await?;
    Ok(page_response(
        "bio",
        &name,
        &[],
        &page,
        0,
        limit,
        query.fmt.as_deref(),
        None,
    ))
}

#[head("/api/bio/all/{index}")]
async fn all_index_head(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> actix_web::Result<impl Responder, BioIndexError> {
    let name = path.into_inner();
    let index = crate::catalog::lookup_any(&state.pool, &name)
        .await?
        .ok_or_else(|| BioIndexError::BadRequest(format!("unknown index {name:?}")))?;
    let reader = crate::planner::fetch_all(&state.store, &index, None).await?;
    Ok(HttpResponse::Ok()
        .insert_header(("Content-Length", reader.bytes_total().to_string()))
        .finish())
}

#[get("/api/bio/cont")]
async fn continue_query(
    state: web::Data<Arc<AppState>>,
    query: web::Query<ContQuery>,
) -> actix_web::Result<impl Responder, BioIndexError> {
    let (body, next_token) = state
        .continuations
        .advance(&query.token, |cb| cb)
        .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "data": body,
        "continuation": next_token,
    })))
}

pub async fn serve(args: &Args, state: Arc<AppState>) -> std::io::Result<()> {
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .service(list_indexes)
            .service(match_index)
            .service(count_index)
            .service(query_index)
            .service(query_index_head)
            .service(all_index)
            .service(all_index_head)
            .service(continue_query)
            .wrap(actix_web::middleware::Logger::default())
    })
    .workers(args.workers)
    .bind((args.listen_host.as_str(), args.listen_port))?
    .run()
    .await
}
