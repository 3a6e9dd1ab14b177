//! # Diagnostic Sink
//!
//! Where corruption reports go. The sink is an explicit handle passed
//! through the engine rather than a process-wide global; it records page
//! dumps for later inspection and emits structured `tracing` events so an
//! operator sees the context immediately.

use parking_lot::Mutex;

use crate::page::Page;

#[derive(Debug, Clone)]
pub struct PageDump {
    pub space_id: u32,
    pub page_no: u32,
    pub level: u16,
    pub n_recs: u16,
    pub context: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub struct DiagSink {
    dumps: Mutex<Vec<PageDump>>,
}

impl DiagSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dump_page(&self, context: &str, page: &Page<'_>) {
        tracing::error!(
            space_id = page.space_id(),
            page_no = page.page_no(),
            level = page.level(),
            n_recs = page.n_recs(),
            context,
            "page dump"
        );
        self.dumps.lock().push(PageDump {
            space_id: page.space_id(),
            page_no: page.page_no(),
            level: page.level(),
            n_recs: page.n_recs(),
            context: context.to_string(),
            bytes: page.bytes().to_vec(),
        });
    }

    pub fn report(&self, context: &str) {
        tracing::error!(context, "index tree diagnostic");
    }

    pub fn dump_count(&self) -> usize {
        self.dumps.lock().len()
    }

    pub fn dumps(&self) -> Vec<PageDump> {
        self.dumps.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::test_util::TestFrame;

    #[test]
    fn dump_captures_page_identity() {
        let mut f = TestFrame::new();
        f.page_mut().create(true);

        let sink = DiagSink::new();
        sink.dump_page("unit test", &f.page());

        let dumps = sink.dumps();
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].page_no, 1);
        assert_eq!(dumps[0].context, "unit test");
        assert_eq!(dumps[0].bytes.len(), crate::page::PAGE_SIZE);
    }
}
