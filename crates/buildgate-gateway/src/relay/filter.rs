use buildgate_core::model::JobResponse;

/// The text to relay for a worker record, if any.
///
/// Only stdout and stderr records are relayed, trimmed of surrounding
/// whitespace; blank ones are dropped.
pub fn output_line(response: &JobResponse) -> Option<String> {
    if !response.is_output() {
        return None;
    }
    let text = response.body_text();
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use buildgate_core::model::ResponseKind;

    use super::*;

    #[test]
    fn forwards_trimmed_output() {
        let stdout = JobResponse::new(ResponseKind::Stdout, "  Step 1/3 : FROM alpine\n");
        assert_eq!(output_line(&stdout).as_deref(), Some("Step 1/3 : FROM alpine"));

        let stderr = JobResponse::new(ResponseKind::Stderr, "warning\r\n");
        assert_eq!(output_line(&stderr).as_deref(), Some("warning"));
    }

    #[test]
    fn drops_blank_bodies() {
        assert!(output_line(&JobResponse::new(ResponseKind::Stdout, " \n\t")).is_none());
        assert!(output_line(&JobResponse::new(ResponseKind::Stderr, "")).is_none());
    }

    #[test]
    fn drops_non_output_kinds() {
        assert!(output_line(&JobResponse::new(ResponseKind::End, "done")).is_none());
        assert!(output_line(&JobResponse::new(ResponseKind::Other, "x")).is_none());
    }
}
