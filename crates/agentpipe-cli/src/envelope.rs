use agentpipe_core::ErrorCode;
use serde::Serialize;
use serde_json::Value;

pub(crate) const SCHEMA_VERSION: u64 = 1;

pub(crate) fn hint(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::EmptyTask => "Pass a non-empty task.",
        ErrorCode::Validation => "Check the arguments and --set keys; nothing was sent.",
        ErrorCode::Auth => {
            "The provider rejected the credentials. Check AGENTPIPE_TAVILY_API_KEY / AGENTPIPE_OPENAI_COMPAT_API_KEY."
        }
        ErrorCode::RateLimit => "The provider is rate limiting. Wait and retry later.",
        ErrorCode::Server | ErrorCode::ServiceUnavailable => {
            "The provider had a server-side failure. Retry later."
        }
        ErrorCode::Timeout => "The call timed out. Raise the timeout or retry.",
        ErrorCode::RetryExhausted => {
            "Every attempt failed with a transient error. Retry later or raise max_retries."
        }
        ErrorCode::Api => "The provider returned an unexpected response.",
        ErrorCode::Fetch => {
            "The page could not be loaded. Check the URL; for JS-heavy pages build with --features chrome."
        }
        ErrorCode::Conversion => "The page loaded but no text could be extracted from it.",
        ErrorCode::Execution => "The task failed while running. See the message for details.",
    }
}

pub(crate) fn error_obj(code: ErrorCode, message: impl ToString) -> Value {
    #[derive(Serialize)]
    struct ErrorObject {
        code: &'static str,
        message: String,
        hint: &'static str,
        retryable: bool,
    }

    let e = ErrorObject {
        code: code.as_str(),
        message: message.to_string(),
        hint: hint(code),
        retryable: code.retryable(),
    };
    serde_json::to_value(e).unwrap_or_else(|_| {
        serde_json::json!({
            "code": code.as_str(),
            "message": message.to_string(),
            "hint": hint(code),
            "retryable": code.retryable()
        })
    })
}

pub(crate) fn ok(kind: &str, elapsed_ms: u64, result: Value) -> Value {
    serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "kind": kind,
        "ok": true,
        "elapsed_ms": elapsed_ms,
        "result": result,
    })
}

pub(crate) fn err(kind: &str, elapsed_ms: u64, code: ErrorCode, message: impl ToString) -> Value {
    serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "kind": kind,
        "ok": false,
        "elapsed_ms": elapsed_ms,
        "error": error_obj(code, message),
    })
}
