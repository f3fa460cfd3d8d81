use crate::assembly::types::SubjectId;

pub fn session_snapshot_key(fingerprint: &str, subject_id: SubjectId) -> String {
    format!("exam_session:{}:{}", fingerprint, subject_id)
}

pub fn generation_lock_key(fingerprint: &str, subject_id: SubjectId) -> String {
    format!("exam_gen_lock:{}:{}", fingerprint, subject_id)
}

pub fn learner_history_key(fingerprint: &str) -> String {
    format!("user_history:{}", fingerprint)
}
