//! Event Dispatcher: workflow/task event taxonomy, template expansion,
//! handler dispatch through the Remote Executor, batched mail, and the
//! rolling scheduler log.

mod bus;
mod dispatcher;
mod logger;
mod mailer;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use dispatcher::{HandlerSpec, dispatch_handler};
pub use logger::RollingLog;
pub use mailer::{BatchClock, MailBatcher, PendingMail};
pub use types::{TaskEventKind, TemplateContext, TemplateError, WorkflowEvent, WorkflowEventKind, expand_template, validate_template};
