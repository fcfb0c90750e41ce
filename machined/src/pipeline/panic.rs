//! Converts task panics into [`MachinedError::TaskPanic`].

use futures::FutureExt;
use machined_shared::{MachinedError, MachinedResult};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Chain a panic hook that records the backtrace of the panicking thread.
pub fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_backtrace() -> String {
    LAST_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| "<backtrace unavailable>".to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Poll `fut`, turning an unwind into a task error.
pub async fn catch_task_panic<F>(task: &str, fut: F) -> MachinedResult<()>
where
    F: Future<Output = MachinedResult<()>>,
{
    install_hook();

    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(MachinedError::TaskPanic {
            task: task.to_string(),
            message: panic_message(payload.as_ref()),
            backtrace: take_backtrace(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explode() -> MachinedResult<()> {
        panic!("boom")
    }

    fn explode_with(value: i32) -> MachinedResult<()> {
        panic!("value was {}", value)
    }

    #[tokio::test]
    async fn test_panic_becomes_task_error() {
        let result = catch_task_panic("explode", async { explode() }).await;

        match result {
            Err(MachinedError::TaskPanic {
                task,
                message,
                backtrace,
            }) => {
                assert_eq!(task, "explode");
                assert_eq!(message, "boom");
                assert!(!backtrace.is_empty());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_regular_errors_pass_through() {
        let result =
            catch_task_panic("fail", async { Err(MachinedError::Internal("x".into())) }).await;
        assert!(matches!(result, Err(MachinedError::Internal(_))));
    }

    #[tokio::test]
    async fn test_formatted_panic_message() {
        let result = catch_task_panic("fmt", async { explode_with(7) }).await;
        assert!(matches!(
            result,
            Err(MachinedError::TaskPanic { message, .. }) if message == "value was 7"
        ));
    }
}
