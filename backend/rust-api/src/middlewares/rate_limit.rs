use anyhow::Context;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use redis::aio::ConnectionManager;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::metrics::track_cache_operation;
use crate::services::{AppState, CACHE_TIMEOUT};

const RATE_LIMIT_PER_STUDENT: u32 = 120; // requests per minute
const RATE_LIMIT_PER_IP: u32 = 300; // requests per minute
const RATE_WINDOW_SECONDS: u64 = 60;

fn extract_client_ip_from(headers: &HeaderMap, extensions: &axum::http::Extensions) -> String {
    // Preferred order: X-Forwarded-For, Forwarded, X-Real-IP, ConnectInfo
    if let Some(v) = headers.get("x-forwarded-for") {
        if let Ok(s) = v.to_str() {
            // x-forwarded-for can be a comma separated list; take first
            return s.split(',').next().unwrap_or(s).trim().to_string();
        }
    }

    if let Some(v) = headers.get("forwarded") {
        if let Ok(s) = v.to_str() {
            for part in s.split(';') {
                let p = part.trim();
                if p.starts_with("for=") {
                    let val = p.trim_start_matches("for=").trim().trim_matches('\"');
                    return val.to_string();
                }
            }
        }
    }

    if let Some(v) = headers.get("x-real-ip") {
        if let Ok(s) = v.to_str() {
            return s.trim().to_string();
        }
    }

    if let Some(ci) = extensions.get::<ConnectInfo<SocketAddr>>() {
        return ci.0.ip().to_string();
    }

    "unknown".to_string()
}

pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let headers = request.headers();
    let extensions = request.extensions();

    let client_ip = extract_client_ip_from(headers, extensions);

    // Game clients identify the learner out of band; used only for limiting.
    let student_id = headers
        .get("x-student-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    // Allow disabling rate limits in local perf runs by setting RATE_LIMIT_DISABLED=1
    let rate_limit_disabled = std::env::var("RATE_LIMIT_DISABLED").unwrap_or_default() == "1";
    if rate_limit_disabled {
        tracing::debug!("Rate limiting disabled via RATE_LIMIT_DISABLED=1");
        return Ok(next.run(request).await);
    }

    if let Some(sid) = &student_id {
        // Allow overriding per-student limit via env RATE_LIMIT_PER_STUDENT
        let student_limit = std::env::var("RATE_LIMIT_PER_STUDENT")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(RATE_LIMIT_PER_STUDENT);

        let outcome = check_rate_limit(
            &state.redis,
            &format!("ratelimit:student:{}", sid),
            student_limit,
        )
        .await;
        limit_outcome(outcome, "student", sid)?;
    }

    // allow overriding per-IP limit via env RATE_LIMIT_PER_IP
    let ip_limit = std::env::var("RATE_LIMIT_PER_IP")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(RATE_LIMIT_PER_IP);

    let outcome = check_rate_limit(
        &state.redis,
        &format!("ratelimit:ip:{}", client_ip),
        ip_limit,
    )
    .await;
    limit_outcome(outcome, "ip", &client_ip)?;

    Ok(next.run(request).await)
}

/// The limiter is advisory: when Redis is unavailable the request passes
/// through instead of failing the practice API behind it.
fn limit_outcome(
    outcome: anyhow::Result<bool>,
    scope: &str,
    key: &str,
) -> Result<(), StatusCode> {
    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => {
            tracing::warn!("Rate limit exceeded for {}: {}", scope, key);
            Err(StatusCode::TOO_MANY_REQUESTS)
        }
        Err(e) => {
            tracing::warn!("Rate limiter unavailable, allowing {} {}: {}", scope, key, e);
            Ok(())
        }
    }
}

/// Check rate limit using Redis with Lua script for atomicity
async fn check_rate_limit(
    redis: &ConnectionManager,
    key: &str,
    limit: u32,
) -> anyhow::Result<bool> {
    let mut conn = redis.clone();

    let lua_script = r#"
        local key = KEYS[1]
        local limit = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])

        local current = redis.call('GET', key)

        if current == false then
            redis.call('SET', key, 1, 'EX', window)
            return 1
        end

        current = tonumber(current)

        if current >= limit then
            return 0
        end

        redis.call('INCR', key)
        return 1
    "#;

    let allowed: u32 = track_cache_operation("rate_limit", async {
        tokio::time::timeout(
            CACHE_TIMEOUT,
            redis::Script::new(lua_script)
                .key(key)
                .arg(limit)
                .arg(RATE_WINDOW_SECONDS)
                .invoke_async(&mut conn),
        )
        .await
        .context("Rate limit check timed out")?
        .context("Rate limit script failed")
    })
    .await?;

    Ok(allowed == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Extensions, HeaderValue};

    #[test]
    fn x_forwarded_for_takes_first_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(
            extract_client_ip_from(&headers, &Extensions::new()),
            "203.0.113.7"
        );
    }

    #[test]
    fn unknown_when_no_source_available() {
        assert_eq!(
            extract_client_ip_from(&HeaderMap::new(), &Extensions::new()),
            "unknown"
        );
    }

    #[test]
    fn within_limit_passes_and_exceeded_rejects() {
        assert!(limit_outcome(Ok(true), "ip", "203.0.113.7").is_ok());
        assert_eq!(
            limit_outcome(Ok(false), "ip", "203.0.113.7"),
            Err(StatusCode::TOO_MANY_REQUESTS)
        );
    }

    #[test]
    fn limiter_outage_fails_open() {
        let outcome = limit_outcome(Err(anyhow::anyhow!("redis timed out")), "student", "s1");
        assert!(outcome.is_ok());
    }
}
