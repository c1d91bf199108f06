//! HTTP surface
//!
//! Thin axum layer: collect parameters, pick the verb, hand over to the
//! [`Dispatcher`]. Every data route answers 200 with an envelope body.

use axum::{
    body::Bytes,
    extract::{FromRequest, Multipart, Path, Request, State},
    http::header::CONTENT_TYPE,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::dispatcher::Dispatcher;
use crate::envelope::Envelope;
use crate::operation::Category;
use crate::params::Params;

pub const BANNER: &str = "Cache Server Running...";

type Shared = State<Arc<Dispatcher>>;

/// Build the router over a shared dispatcher
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/info", get(info))
        .route("/server", get(server))
        .route("/db", get(shard_size))
        .route("/key", get(key_get))
        .route("/key/{key}", put(key_expire).delete(key_delete))
        .route("/string", post(string_set).get(string_get))
        .route("/string/{key}", put(string_set_at))
        .route("/hash", post(hash_set).get(hash_get))
        .route("/hash/{key}", put(hash_set_at))
        .route("/hash/{key}/{field}", delete(hash_delete))
        .route("/set", post(set_add).get(set_get))
        .route("/set/{key}", put(set_update).delete(set_delete))
        .route("/set/{key}/{destination}", put(set_update_into))
        .route("/zset", post(zset_add).get(zset_get))
        .route("/list", post(list_push))
        .with_state(dispatcher)
}

/// Parameters of one request: form body first, then the query string.
///
/// The body may be `application/x-www-form-urlencoded` or
/// `multipart/form-data`; repeated names keep their order in both.
pub struct RequestParams(pub Params);

impl<S> FromRequest<S> for RequestParams
where
    S: Send + Sync,
{
    type Rejection = Json<Envelope>;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let query = req.uri().query().map(str::to_string);
        let is_multipart = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map_or(false, |value| {
                value.to_ascii_lowercase().starts_with("multipart/form-data")
            });

        let mut params = if is_multipart {
            let mut form = Multipart::from_request(req, state).await.map_err(reject)?;
            let mut params = Params::new();
            while let Some(field) = form.next_field().await.map_err(reject)? {
                let Some(name) = field.name().map(str::to_string) else {
                    continue;
                };
                let value = field.text().await.map_err(reject)?;
                params.push(&name, &value);
            }
            params
        } else {
            let body = Bytes::from_request(req, state).await.map_err(reject)?;
            Params::from_request(None, &body)
        };

        if let Some(query) = query {
            params.extend_query(&query);
        }
        Ok(RequestParams(params))
    }
}

fn reject(err: impl fmt::Display) -> Json<Envelope> {
    warn!(error = %err, "Unreadable request body");
    Json(Envelope::error(err.to_string()))
}

/// Admitted shard summary
#[derive(Debug, Serialize)]
pub struct ServerSummary {
    pub shards: usize,
    pub names: Vec<String>,
}

async fn info() -> &'static str {
    BANNER
}

async fn server(State(dispatcher): Shared) -> Json<ServerSummary> {
    let names = dispatcher.connections().shard_names();
    Json(ServerSummary {
        shards: names.len(),
        names,
    })
}

async fn shard_size(State(dispatcher): Shared, RequestParams(params): RequestParams) -> Json<Envelope> {
    let envelope = match params.required("shard") {
        Ok(shard) => dispatcher.shard_size(&shard).await,
        Err(err) => Envelope::Param(err.0),
    };
    Json(envelope)
}

async fn run(dispatcher: &Dispatcher, category: Category, verb: &str, params: Params) -> Json<Envelope> {
    Json(dispatcher.handle(category, verb, &params).await)
}

/// Verb named by `type`, or `default` when absent
fn verb_or(params: &Params, default: &str) -> String {
    match params.get("type") {
        Some(verb) if !verb.is_empty() => verb.to_lowercase(),
        _ => default.to_string(),
    }
}

async fn key_get(State(dispatcher): Shared, RequestParams(params): RequestParams) -> Json<Envelope> {
    // Only `exists` is a read on this route; anything else is a bad `type`
    let verb = match verb_or(&params, "").as_str() {
        "exists" => "exists",
        _ => "",
    };
    run(&dispatcher, Category::Key, verb, params).await
}

async fn key_expire(
    State(dispatcher): Shared,
    Path(key): Path<String>,
    RequestParams(params): RequestParams,
) -> Json<Envelope> {
    run(&dispatcher, Category::Key, "expire", params.with_path("key", &key)).await
}

async fn key_delete(State(dispatcher): Shared, Path(key): Path<String>) -> Json<Envelope> {
    run(&dispatcher, Category::Key, "del", Params::new().with_path("key", &key)).await
}

async fn string_set(State(dispatcher): Shared, RequestParams(params): RequestParams) -> Json<Envelope> {
    run(&dispatcher, Category::String, "set", params).await
}

async fn string_set_at(
    State(dispatcher): Shared,
    Path(key): Path<String>,
    RequestParams(params): RequestParams,
) -> Json<Envelope> {
    run(&dispatcher, Category::String, "set", params.with_path("key", &key)).await
}

async fn string_get(State(dispatcher): Shared, RequestParams(params): RequestParams) -> Json<Envelope> {
    run(&dispatcher, Category::String, "get", params).await
}

async fn hash_set(State(dispatcher): Shared, RequestParams(params): RequestParams) -> Json<Envelope> {
    run(&dispatcher, Category::Hash, "hset", params).await
}

async fn hash_set_at(
    State(dispatcher): Shared,
    Path(key): Path<String>,
    RequestParams(params): RequestParams,
) -> Json<Envelope> {
    run(&dispatcher, Category::Hash, "hset", params.with_path("key", &key)).await
}

async fn hash_get(State(dispatcher): Shared, RequestParams(params): RequestParams) -> Json<Envelope> {
    let verb = verb_or(&params, "hgetall");
    run(&dispatcher, Category::Hash, &verb, params).await
}

async fn hash_delete(
    State(dispatcher): Shared,
    Path((key, field)): Path<(String, String)>,
) -> Json<Envelope> {
    let params = Params::new().with_path("field", &field).with_path("key", &key);
    run(&dispatcher, Category::Hash, "hdel", params).await
}

async fn set_add(State(dispatcher): Shared, RequestParams(params): RequestParams) -> Json<Envelope> {
    run(&dispatcher, Category::Set, "sadd", params).await
}

async fn set_get(State(dispatcher): Shared, RequestParams(params): RequestParams) -> Json<Envelope> {
    let verb = verb_or(&params, "smembers");
    run(&dispatcher, Category::Set, &verb, params).await
}

async fn set_update(
    State(dispatcher): Shared,
    Path(key): Path<String>,
    RequestParams(params): RequestParams,
) -> Json<Envelope> {
    let params = params.with_path("key", &key);
    let verb = verb_or(&params, "");
    run(&dispatcher, Category::Set, &verb, params).await
}

async fn set_update_into(
    State(dispatcher): Shared,
    Path((key, destination)): Path<(String, String)>,
    RequestParams(params): RequestParams,
) -> Json<Envelope> {
    let params = params
        .with_path("destination", &destination)
        .with_path("key", &key);
    let verb = verb_or(&params, "smove");
    run(&dispatcher, Category::Set, &verb, params).await
}

async fn set_delete(State(dispatcher): Shared, Path(key): Path<String>) -> Json<Envelope> {
    run(&dispatcher, Category::Set, "del", Params::new().with_path("key", &key)).await
}

async fn zset_add(State(dispatcher): Shared, RequestParams(params): RequestParams) -> Json<Envelope> {
    run(&dispatcher, Category::SortedSet, "zadd", params).await
}

async fn zset_get(State(dispatcher): Shared, RequestParams(params): RequestParams) -> Json<Envelope> {
    let verb = verb_or(&params, "");
    run(&dispatcher, Category::SortedSet, &verb, params).await
}

async fn list_push(State(dispatcher): Shared, RequestParams(params): RequestParams) -> Json<Envelope> {
    run(&dispatcher, Category::List, "lpush", params).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_or() {
        assert_eq!(verb_or(&Params::parse("type=HMGET"), "hgetall"), "hmget");
        assert_eq!(verb_or(&Params::parse("type="), "hgetall"), "hgetall");
        assert_eq!(verb_or(&Params::parse(""), "smembers"), "smembers");
    }
}
