use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::HeaderMap;
use http::header::RETRY_AFTER;

use crate::error::Error;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn merge_headers(default_headers: &HeaderMap, request_headers: &HeaderMap) -> HeaderMap {
    let mut merged = default_headers.clone();
    for (name, value) in request_headers {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

/// `Retry-After` as a duration: either delta-seconds or an HTTP-date
/// relative to `now`. Absent, malformed, or already-elapsed values are
/// `None`.
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let retry_at = httpdate::parse_http_date(value).ok()?;
    retry_at.duration_since(now).ok()
}

/// Substitutes `{NAME}` slots in an endpoint template. Every placeholder
/// must have a value; unclosed braces pass through untouched.
pub(crate) fn format_endpoint(
    template: &str,
    args: &BTreeMap<String, String>,
) -> crate::Result<String> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let placeholder = &after_open[..close];
                match args.get(placeholder) {
                    Some(value) => output.push_str(value),
                    None => {
                        return Err(Error::Template {
                            endpoint: template.to_owned(),
                            placeholder: placeholder.to_owned(),
                        });
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                output.push_str(&rest[open..]);
                return Ok(output);
            }
        }
    }

    output.push_str(rest);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn format_endpoint_substitutes_args() {
        let args = BTreeMap::from([("NAME".to_owned(), "pikachu".to_owned())]);
        assert_eq!(
            format_endpoint("/pokemon/{NAME}", &args).expect("template formats"),
            "/pokemon/pikachu"
        );
    }

    #[test]
    fn format_endpoint_rejects_missing_arg() {
        let error = format_endpoint("/pokemon/{NAME}", &BTreeMap::new())
            .expect_err("missing arg should fail");
        assert_eq!(error.kind(), crate::ErrorKind::Template);
    }

    #[test]
    fn parse_retry_after_reads_delta_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("5"));
        assert_eq!(
            parse_retry_after(&headers, SystemTime::UNIX_EPOCH),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn parse_retry_after_reads_http_date() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let retry_at = now + Duration::from_secs(30);
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_str(&httpdate::fmt_http_date(retry_at))
                .expect("valid retry-after date"),
        );
        assert_eq!(
            parse_retry_after(&headers, now),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn parse_retry_after_ignores_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("soonish"));
        assert_eq!(parse_retry_after(&headers, SystemTime::now()), None);
    }
}
