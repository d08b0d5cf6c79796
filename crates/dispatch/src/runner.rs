//! Running one task request against an evaluator.

use std::path::Path;

use eval::{EvalError, Evaluator, Namespace};
use tracing::{debug, warn};

use crate::{TaskOutcome, TaskRequest};

fn run_script(
    evaluator: &dyn Evaluator,
    request: &TaskRequest,
    ns: &mut Namespace,
) -> Result<(), EvalError> {
    if !request.global_def.trim().is_empty() {
        evaluator.exec(&request.global_def, ns)?;
    }
    let workdir = request.workdir.as_deref().map(Path::new);
    evaluator.exec_in(&request.script, ns, workdir)?;
    Ok(())
}

/// Run `request` to completion in the calling thread.
///
/// Never fails: evaluation errors become a non-zero return code and an
/// abort becomes a skipped, successful outcome.
pub fn execute_task(evaluator: &dyn Evaluator, request: &TaskRequest) -> TaskOutcome {
    let mut ns = Namespace::from_snapshot(request.namespace.clone());
    debug!("executing task {} (group {})", request.id, request.index);

    let (ret_code, error, skipped) = match run_script(evaluator, request, &mut ns) {
        Ok(()) => (0, None, false),
        Err(EvalError::Abort(message)) => {
            if let Some(message) = &message {
                warn!("task {} aborted: {message}", request.id);
            }
            (0, message, true)
        }
        Err(e) => (1, Some(e.to_string()), false),
    };

    let output = ns
        .slots()
        .step_output
        .as_ref()
        .and_then(|files| files.files())
        .map(<[String]>::to_vec);

    TaskOutcome {
        task_id: request.id.clone(),
        index: request.index,
        ret_code,
        output,
        error,
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eval::mock::MockEvaluator;
    use eval::{FileSet, NamespaceSnapshot};

    fn request(script: &str) -> TaskRequest {
        let mut ns = NamespaceSnapshot::default();
        ns.slots.step_output = Some(FileSet::Files(vec!["out.txt".into()]));
        TaskRequest::new(script, "setup", ns)
    }

    #[test]
    fn success_reports_output_and_runs_the_preamble_first() {
        let evaluator = MockEvaluator::new();
        let outcome = execute_task(&evaluator, &request("work"));
        assert!(outcome.succeeded());
        assert_eq!(outcome.output, Some(vec!["out.txt".to_string()]));
        assert_eq!(*evaluator.calls.lock().unwrap(), vec!["setup", "work"]);
    }

    #[test]
    fn failures_and_aborts() {
        let evaluator = MockEvaluator::new()
            .on("boom", |_| Err(EvalError::Failed("exit 2".into())))
            .aborting("stop", Some("nothing to do"));

        let failed = execute_task(&evaluator, &request("boom"));
        assert_eq!(failed.ret_code, 1);
        assert!(failed.error.unwrap().contains("exit 2"));

        let stopped = execute_task(&evaluator, &request("stop"));
        assert!(stopped.succeeded());
        assert!(stopped.skipped);
    }
}
