#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use exam_backend::assembly::types::{
    ContentItem, ItemId, Pool, QuestionPayload, SubjectId, Topic,
};
use exam_backend::assembly::{GenerationError, GenerationSeed, QuestionGenerator};
use exam_backend::cache::MemoryCache;
use exam_backend::clock::Clock;
use exam_backend::config::ExamConfig;
use exam_backend::db::MemoryExamStore;
use exam_backend::services::{ExamContext, SessionManager};
use exam_backend::state::AppState;

pub const SUBJECT: SubjectId = 1;
pub const CORRECT: &str = "A";

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc::now()),
        }
    }

    pub fn advance(&self, seconds: i64) {
        *self.now.lock() += chrono::Duration::seconds(seconds);
    }

    pub fn advance_millis(&self, millis: i64) {
        *self.now.lock() += chrono::Duration::milliseconds(millis);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub enum Script {
    /// One valid variant per seed.
    Echo,
    Fail,
    /// Valid variants followed by junk that must be rejected.
    EchoWithJunk,
    /// Never answers.
    Hang,
}

pub struct ScriptedGenerator {
    script: Script,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<ItemId>>>,
}

impl ScriptedGenerator {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Seed ids of every request, in call order.
    pub fn requests(&self) -> Vec<Vec<ItemId>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl QuestionGenerator for ScriptedGenerator {
    async fn generate_variants(&self, seeds: &[GenerationSeed]) -> Result<Vec<Value>, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(seeds.iter().map(|s| s.id).collect());
        if matches!(self.script, Script::Hang) {
            std::future::pending::<()>().await;
        }

        let variants = seeds.iter().map(|seed| {
            json!({
                "based_on_id": seed.id,
                "content": format!("Variant of question {} for {}", seed.id, seed.topic),
                "options": ["A. first", "B. second", "C. third", "D. fourth"],
                "answer": "B",
                "explanation": "generated"
            })
        });

        match self.script {
            Script::Echo => Ok(variants.collect()),
            Script::Fail => Err(GenerationError::Provider("upstream 503".to_string())),
            Script::Hang => unreachable!("pending never resolves"),
            Script::EchoWithJunk => {
                let mut out: Vec<Value> = variants.collect();
                out.push(json!({ "based_on_id": 999_999, "content": "Orphan variant", "options": ["A", "B"], "answer": "A" }));
                out.push(json!({ "based_on_id": seeds[0].id, "content": "xxx placeholder", "options": ["A", "B"], "answer": "A" }));
                Ok(out)
            }
        }
    }
}

/// Pool sizes of a seeded subject. Past-exam and exercise items alternate
/// between topics 1 and 2, ai-generated items sit on topic 2 and the
/// low-salience pool on topic 3 (itself low-salience).
#[derive(Debug, Clone, Copy)]
pub struct CatalogShape {
    pub past: usize,
    pub exercise: usize,
    pub ai: usize,
    pub low: usize,
}

impl CatalogShape {
    pub const FULL: CatalogShape = CatalogShape {
        past: 40,
        exercise: 80,
        ai: 10,
        low: 10,
    };

    pub const SMALL: CatalogShape = CatalogShape {
        past: 20,
        exercise: 30,
        ai: 5,
        low: 5,
    };

    pub fn total(&self) -> usize {
        self.past + self.exercise + self.ai + self.low
    }
}

pub fn topics() -> Vec<Topic> {
    vec![
        Topic {
            id: 1,
            subject_id: SUBJECT,
            name: "Networking".to_string(),
            base_weight: 3.0,
            low_salience: false,
        },
        Topic {
            id: 2,
            subject_id: SUBJECT,
            name: "Databases".to_string(),
            base_weight: 2.0,
            low_salience: false,
        },
        Topic {
            id: 3,
            subject_id: SUBJECT,
            name: "History of computing".to_string(),
            base_weight: 0.0,
            low_salience: true,
        },
    ]
}

pub fn item(id: ItemId, topic_id: i64, pool: Pool) -> ContentItem {
    ContentItem {
        id,
        topic_id: Some(topic_id),
        pool,
        source_detail: None,
        payload: QuestionPayload {
            content: format!("Question number {id}"),
            options: json!(["A. yes", "B. no", "C. maybe", "D. never"]),
            answer: CORRECT.to_string(),
            explanation: format!("Explanation {id}"),
        },
    }
}

pub fn seed_catalog(store: &MemoryExamStore, shape: CatalogShape) {
    store.add_topics(topics());

    let mut items = Vec::with_capacity(shape.total());
    let mut next: ItemId = 1;
    let mut push = |count: usize, pool: Pool, topic_for: &dyn Fn(usize) -> i64| {
        for i in 0..count {
            items.push(item(next, topic_for(i), pool));
            next += 1;
        }
    };
    push(shape.past, Pool::PastExam, &|i: usize| 1 + (i % 2) as i64);
    push(shape.exercise, Pool::Exercise, &|i: usize| 1 + (i % 2) as i64);
    push(shape.ai, Pool::AiGenerated, &|_: usize| 2);
    push(shape.low, Pool::LowSalience, &|_: usize| 3);

    store.add_items(SUBJECT, items);
}

pub fn fast_config() -> ExamConfig {
    ExamConfig {
        lock_poll_interval: Duration::from_millis(20),
        lock_poll_attempts: 25,
        ..ExamConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<MemoryExamStore>,
    pub cache: Arc<MemoryCache>,
    pub clock: Arc<ManualClock>,
    pub manager: Arc<SessionManager>,
}

impl Harness {
    pub fn new(shape: CatalogShape) -> Self {
        Self::build(shape, fast_config(), None)
    }

    pub fn with_generator(shape: CatalogShape, generator: Arc<dyn QuestionGenerator>) -> Self {
        Self::build(shape, fast_config(), Some(generator))
    }

    pub fn build(
        shape: CatalogShape,
        config: ExamConfig,
        generator: Option<Arc<dyn QuestionGenerator>>,
    ) -> Self {
        let store = Arc::new(MemoryExamStore::new());
        seed_catalog(&store, shape);
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(MemoryCache::with_clock(clock.clone()));

        let mut ctx = ExamContext::new(store.clone(), cache.clone(), config).with_clock(clock.clone());
        if let Some(generator) = generator {
            ctx = ctx.with_generator(generator);
        }

        Self {
            store,
            cache,
            clock,
            manager: Arc::new(SessionManager::new(ctx)),
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(self.manager.clone(), None)
    }
}
