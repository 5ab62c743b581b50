//! Public facade crate for `agentpipe`.
//!
//! No IO or provider-specific logic lives here; it re-exports the backend-agnostic
//! types and traits from `agentpipe-core`.

pub use agentpipe_core::*;

#[cfg(test)]
mod tests {
    #[test]
    fn reexports_the_result_contract() {
        let r = crate::ExecutionResult::error(
            "task is empty",
            crate::ErrorCode::EmptyTask,
            std::time::Duration::from_millis(0),
        );
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["code"], "EMPTY_TASK");
    }
}
