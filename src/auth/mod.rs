//! Authentication flow: the SSO and SLO state machine.

pub mod flow;

pub use flow::{AuthFlow, LogoutDispatch, LogoutOutcome, HOME_PATH, LOGIN_PATH};
