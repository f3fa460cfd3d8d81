pub mod device;
pub mod exam_session;
pub mod grading;
pub mod llm_provider;
pub mod question_generator;

pub use exam_session::{ExamContext, SessionError, SessionManager};
