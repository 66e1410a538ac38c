//! Per-PID request routing.
//!
//! A stream is one PID carrying DSM-CC sections. Carousels register what
//! they wait for on it; an incoming section is handed to every carousel
//! whose request it answers. Section filters are installed with the
//! [`DvbStack`] when the first request needing them appears and removed
//! with the last one.

use std::collections::{BTreeSet, HashMap, VecDeque};

use log::trace;

use dsmcc_protocol::{transaction_matches, SectionFilter};

use crate::callbacks::DvbStack;
use crate::module::ModuleKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRequest {
    Dsi,
    Dii { transaction_id: u32 },
    Ddb { key: ModuleKey },
}

impl StreamRequest {
    fn filter(&self) -> SectionFilter {
        match self {
            StreamRequest::Dsi => SectionFilter::dsi(),
            StreamRequest::Dii { transaction_id } => SectionFilter::dii(*transaction_id),
            StreamRequest::Ddb { key } => SectionFilter::ddb(key.module_id),
        }
    }
}

/// What an incoming section answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Dsi,
    Dii { transaction_id: u32 },
    Ddb { key: ModuleKey },
}

impl Answer {
    fn answers(&self, request: &StreamRequest) -> bool {
        match (self, request) {
            (Answer::Dsi, StreamRequest::Dsi) => true,
            (Answer::Dii { transaction_id: a }, StreamRequest::Dii { transaction_id: b }) => {
                transaction_matches(*a, *b)
            }
            (Answer::Ddb { key: a }, StreamRequest::Ddb { key: b }) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct Stream {
    pub pid: u16,
    pub assoc_tags: BTreeSet<u16>,
    /// Pending requests in arrival order, with the owning carousel PID.
    requests: VecDeque<(u16, StreamRequest)>,
    filters: HashMap<SectionFilter, usize>,
}

impl Stream {
    pub fn new(pid: u16) -> Self {
        Self {
            pid,
            assoc_tags: BTreeSet::new(),
            requests: VecDeque::new(),
            filters: HashMap::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn has_request(&self, owner: u16, request: &StreamRequest) -> bool {
        self.requests.iter().any(|(o, r)| *o == owner && r == request)
    }

    /// Register a request; a repeat is ignored.
    pub fn subscribe(&mut self, owner: u16, request: StreamRequest, dvb: &dyn DvbStack) {
        if self.has_request(owner, &request) {
            return;
        }
        self.requests.push_back((owner, request));
        let filter = request.filter();
        let count = self.filters.entry(filter).or_insert(0);
        *count += 1;
        if *count == 1 {
            trace!("PID 0x{:04X}: adding filter for {:?}", self.pid, request);
            dvb.add_section_filter(self.pid, &filter);
        }
    }

    /// Install the filter of an existing request again.
    pub fn refresh(&self, request: &StreamRequest, dvb: &dyn DvbStack) {
        dvb.add_section_filter(self.pid, &request.filter());
    }

    pub fn unsubscribe(&mut self, owner: u16, request: &StreamRequest, dvb: &dyn DvbStack) {
        let before = self.requests.len();
        self.requests.retain(|(o, r)| !(*o == owner && r == request));
        if self.requests.len() != before {
            self.release(request.filter(), dvb);
        }
    }

    /// Drop every request of a carousel.
    pub fn remove_owner(&mut self, owner: u16, dvb: &dyn DvbStack) {
        let mut released = Vec::new();
        self.requests.retain(|(o, r)| {
            if *o == owner {
                released.push(r.filter());
                false
            } else {
                true
            }
        });
        for filter in released {
            self.release(filter, dvb);
        }
    }

    fn release(&mut self, filter: SectionFilter, dvb: &dyn DvbStack) {
        if let Some(count) = self.filters.get_mut(&filter) {
            *count -= 1;
            if *count == 0 {
                self.filters.remove(&filter);
                dvb.remove_section_filter(self.pid, &filter);
            }
        }
    }

    /// Carousels waiting for `answer`, in request order, without repeats.
    pub fn owners_for(&self, answer: &Answer) -> Vec<u16> {
        let mut owners = Vec::new();
        for (owner, request) in &self.requests {
            if answer.answers(request) && !owners.contains(owner) {
                owners.push(*owner);
            }
        }
        owners
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        added: Mutex<Vec<(u16, SectionFilter)>>,
        removed: Mutex<Vec<(u16, SectionFilter)>>,
    }

    impl DvbStack for Recorder {
        fn add_section_filter(&self, pid: u16, filter: &SectionFilter) {
            self.added.lock().push((pid, *filter));
        }

        fn remove_section_filter(&self, pid: u16, filter: &SectionFilter) {
            self.removed.lock().push((pid, *filter));
        }

        fn get_pid_for_assoc_tag(&self, _assoc_tag: u16) -> Option<u16> {
            None
        }
    }

    #[test]
    fn test_filters_are_shared_between_owners() {
        let dvb = Recorder::default();
        let mut stream = Stream::new(0x100);
        stream.subscribe(1, StreamRequest::Dsi, &dvb);
        stream.subscribe(2, StreamRequest::Dsi, &dvb);
        stream.subscribe(2, StreamRequest::Dsi, &dvb);
        assert_eq!(dvb.added.lock().len(), 1);

        stream.unsubscribe(1, &StreamRequest::Dsi, &dvb);
        assert!(dvb.removed.lock().is_empty());
        stream.remove_owner(2, &dvb);
        assert_eq!(dvb.removed.lock().len(), 1);
        assert!(stream.is_idle());
    }

    #[test]
    fn test_routing() {
        let dvb = Recorder::default();
        let mut stream = Stream::new(0x100);
        let key = ModuleKey {
            download_id: 7,
            module_id: 3,
        };
        stream.subscribe(1, StreamRequest::Dii { transaction_id: 0x8000_0002 }, &dvb);
        stream.subscribe(2, StreamRequest::Ddb { key }, &dvb);

        assert_eq!(
            stream.owners_for(&Answer::Dii {
                transaction_id: 0x8000_0003
            }),
            vec![1]
        );
        assert_eq!(stream.owners_for(&Answer::Ddb { key }), vec![2]);
        assert!(stream.owners_for(&Answer::Dsi).is_empty());
    }
}
