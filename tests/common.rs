#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use scanx_pagemap::fallback::{AiVerdict, EscalationRequest, StepClassifier};
use scanx_pagemap::{
    Document, DocumentId, FallbackError, Line, Page, PatternTable, Polygon, SlotStepTable,
    StepId, Template, TEMPLATE_SLOTS,
};

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
            .with_test_writer()
            .try_init();
    });
}

/// Heading that the built-in pattern table maps to `page_type`, and to no
/// other type with the same priority.
pub fn marker_for(page_type: &str) -> &'static str {
    match page_type {
        "cover" => "แบบ ผย. 1",
        "instructions" => "คำอธิบาย",
        "personal_info" => "ข้อมูลส่วนบุคคล",
        "spouse_info" => "สถานภาพการสมรส",
        "children" => "บุตรบุญธรรม",
        "siblings" => "พี่น้องร่วมบิดามารดา",
        "income_expense" => "ข้อมูลรายได้ต่อปีและรายจ่ายต่อปี",
        "tax_info" => "ข้อมูลการเสียภาษี",
        "assets_summary" => "ข้อมูลรายการทรัพย์สินและหนี้สิน",
        "attachments" => "คำรับรอง",
        "cash" => "รายละเอียดประกอบรายการเงินสด",
        "deposits" => "รายละเอียดประกอบรายการเงินฝาก",
        "investments" => "รายละเอียดประกอบรายการเงินลงทุน",
        "loans_given" => "รายละเอียดประกอบรายการเงินให้กู้ยืม",
        "land" => "รายละเอียดประกอบรายการที่ดิน",
        "buildings" => "รายละเอียดประกอบรายการโรงเรือนและสิ่งปลูกสร้าง",
        "vehicles" => "รายละเอียดประกอบรายการยานพาหนะ",
        "concessions" => "รายละเอียดประกอบรายการสิทธิและสัมปทาน",
        "other_assets" => "รายละเอียดประกอบรายการทรัพย์สินอื่น",
        "overdraft" => "รายละเอียดประกอบรายการเงินเบิกเกินบัญชี",
        "bank_loans" => "รายละเอียดประกอบรายการเงินกู้จากธนาคาร",
        "written_debts" => "รายละเอียดประกอบรายการหนี้สินที่มีหลักฐาน",
        "documents_list" => "รายละเอียดของเอกสารประกอบ",
        other => panic!("no marker for page type {other}"),
    }
}

/// Deterministic pseudo-random lowercase words, distinct per seed.
pub fn gibberish(seed: u64, words: usize) -> String {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..words)
        .map(|_| {
            (0..7)
                .map(|_| {
                    state = state
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    (b'a' + ((state >> 33) % 26) as u8) as char
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub const BODY_LINES: usize = 8;

/// Lines of the reference form for one slot: the heading, then body lines
/// nobody else shares.
pub fn slot_lines(slot: u32, page_type: &str) -> Vec<Line> {
    let mut lines = vec![Line::new(
        marker_for(page_type),
        Polygon::rect(1.0, 0.6, 7.0, 0.9),
    )];
    for k in 0..BODY_LINES {
        let y = 1.2 + k as f64 * 1.1;
        lines.push(Line::new(
            gibberish(slot as u64 * 100 + k as u64, 3),
            Polygon::rect(0.8, y, 7.4, y + 0.3),
        ));
    }
    lines
}

pub fn slot_page(doc: &DocumentId, page_number: u32, slot: u32) -> Page {
    let steps = slot_steps();
    let page_type = steps
        .get(slot)
        .map(|s| s.page_type.as_str().to_string())
        .unwrap_or_default();
    Page::new(doc.clone(), page_number, slot_lines(slot, &page_type))
}

pub fn slot_steps() -> SlotStepTable {
    SlotStepTable::builtin().unwrap()
}

pub fn patterns() -> Arc<PatternTable> {
    Arc::new(PatternTable::builtin().unwrap())
}

pub fn template() -> Arc<Template> {
    let reference = DocumentId::new("reference");
    let pages: Vec<Page> = (1..=TEMPLATE_SLOTS as u32)
        .map(|slot| slot_page(&reference, slot, slot))
        .collect();
    Arc::new(Template::from_reference_pages("test-1", &pages, &slot_steps()).unwrap())
}

/// A document whose pages reproduce the given slots, numbered 1..
pub fn document_from_slots(id: &str, slots: &[u32]) -> Document {
    let doc = DocumentId::new(id);
    let pages = slots
        .iter()
        .enumerate()
        .map(|(idx, &slot)| slot_page(&doc, idx as u32 + 1, slot))
        .collect();
    Document::new(doc, pages)
}

pub fn clean_document(id: &str) -> Document {
    let slots: Vec<u32> = (1..=TEMPLATE_SLOTS as u32).collect();
    document_from_slots(id, &slots)
}

/// Counts calls and answers with a fixed verdict.
pub struct CountingClassifier {
    pub calls: AtomicUsize,
    pub answer: Result<AiVerdict, ()>,
}

impl CountingClassifier {
    pub fn answering(step: &str, confidence: f64) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            answer: Ok(AiVerdict {
                step: StepId::new(step),
                confidence,
            }),
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            answer: Err(()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepClassifier for CountingClassifier {
    async fn classify(&self, _request: &EscalationRequest) -> Result<AiVerdict, FallbackError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().map_err(|_| FallbackError::Status(503))
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Page whose every line reads the same, so it scores alike against any
/// slot built the same way.
pub fn uniform_page(doc: &DocumentId, page_number: u32) -> Page {
    let lines = (0..BODY_LINES + 1)
        .map(|k| {
            let y = 0.6 + k as f64 * 1.1;
            Line::new("zzzz qqqq", Polygon::rect(0.8, y, 7.4, y + 0.3))
        })
        .collect();
    Page::new(doc.clone(), page_number, lines)
}

/// Template whose 37 slots cannot be told apart.
pub fn uniform_template() -> Arc<Template> {
    let reference = DocumentId::new("uniform");
    let pages: Vec<Page> = (1..=TEMPLATE_SLOTS as u32)
        .map(|slot| uniform_page(&reference, slot))
        .collect();
    Arc::new(Template::from_reference_pages("uniform-1", &pages, &slot_steps()).unwrap())
}

pub fn uniform_document(id: &str) -> Document {
    let doc = DocumentId::new(id);
    let pages = (1..=TEMPLATE_SLOTS as u32)
        .map(|n| uniform_page(&doc, n))
        .collect();
    Document::new(doc, pages)
}
