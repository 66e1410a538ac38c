//! Software demultiplexer.
//!
//! Splits a transport stream into sections for the PIDs the engine has
//! filters on, and follows PAT/PMT so association tags can be resolved
//! through the stream identifier descriptors of the PMT.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, trace, warn};

use dsmcc_carousel::{SectionAssembler, TsPacketIterator};
use dsmcc_protocol::Section;

use crate::bridge::SoftwareDvb;

/// PAT PID.
pub const PAT_PID: u16 = 0x0000;

pub mod table_id {
    pub const PAT: u8 = 0x00;
    pub const PMT: u8 = 0x02;
}

/// stream_identifier_descriptor.
const STREAM_IDENTIFIER_DESCRIPTOR: u8 = 0x52;

/// One elementary stream of a PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: u8,
    pub elementary_pid: u16,
    /// Component tag from the stream identifier descriptor.
    pub component_tag: Option<u8>,
}

/// Program number to PMT PID, from a PAT section payload.
pub fn parse_pat(payload: &[u8]) -> Vec<(u16, u16)> {
    payload
        .chunks_exact(4)
        .map(|e| {
            let program = ((e[0] as u16) << 8) | e[1] as u16;
            let pid = ((e[2] as u16 & 0x1F) << 8) | e[3] as u16;
            (program, pid)
        })
        // Program 0 is the network PID.
        .filter(|(program, _)| *program != 0)
        .collect()
}

/// Elementary streams of a PMT section payload.
pub fn parse_pmt(payload: &[u8]) -> Result<Vec<PmtStream>, &'static str> {
    if payload.len() < 4 {
        return Err("PMT data too short");
    }
    let program_info_length = ((payload[2] as usize & 0x0F) << 8) | payload[3] as usize;
    if payload.len() < 4 + program_info_length {
        return Err("Invalid program info length");
    }

    let mut streams = Vec::new();
    let mut offset = 4 + program_info_length;
    while offset + 5 <= payload.len() {
        let stream_type = payload[offset];
        let elementary_pid = ((payload[offset + 1] as u16 & 0x1F) << 8) | payload[offset + 2] as u16;
        let es_info_length = ((payload[offset + 3] as usize & 0x0F) << 8) | payload[offset + 4] as usize;
        offset += 5;
        if offset + es_info_length > payload.len() {
            return Err("ES info runs past the section");
        }
        let component_tag = component_tag(&payload[offset..offset + es_info_length]);
        offset += es_info_length;
        streams.push(PmtStream {
            stream_type,
            elementary_pid,
            component_tag,
        });
    }
    Ok(streams)
}

fn component_tag(mut descriptors: &[u8]) -> Option<u8> {
    while descriptors.len() >= 2 {
        let tag = descriptors[0];
        let len = descriptors[1] as usize;
        let body = descriptors.get(2..2 + len)?;
        if tag == STREAM_IDENTIFIER_DESCRIPTOR && len >= 1 {
            return Some(body[0]);
        }
        descriptors = &descriptors[2 + len..];
    }
    None
}

pub struct Demux {
    assembler: SectionAssembler,
    dvb: Arc<SoftwareDvb>,
    /// PMT PID to program number.
    pmt_pids: HashMap<u16, u16>,
    /// Program whose PMT supplies association tags, if restricted.
    program: Option<u16>,
    /// Last PMT version seen per program.
    pmt_versions: HashMap<u16, u8>,
    /// Trailing bytes of the previous chunk.
    carry: Vec<u8>,
    packets: u64,
}

impl Demux {
    pub fn new(max_section_size: usize, dvb: Arc<SoftwareDvb>, program: Option<u16>) -> Self {
        let mut assembler = SectionAssembler::new(max_section_size);
        assembler.track(PAT_PID);
        Self {
            assembler,
            dvb,
            pmt_pids: HashMap::new(),
            program,
            pmt_versions: HashMap::new(),
            carry: Vec::new(),
            packets: 0,
        }
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Feed a chunk of the stream and return the carousel sections it
    /// completed, with their PID, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<(u16, Bytes)> {
        self.sync_tracked();

        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(chunk);

        let mut out = Vec::new();
        let mut iter = TsPacketIterator::new(&data);
        for packet in iter.by_ref() {
            self.packets += 1;
            let pid = packet.header.pid;
            for section in self.assembler.push(&packet) {
                if pid == PAT_PID {
                    self.on_pat(&section);
                } else if self.pmt_pids.contains_key(&pid) {
                    self.on_pmt(pid, &section);
                }
                if self.dvb.wants(pid, &section) {
                    out.push((pid, Bytes::from(section)));
                }
            }
            // A filter added by the engine takes effect on the next chunk,
            // PSI changes take effect right away.
            if pid == PAT_PID || self.pmt_pids.contains_key(&pid) {
                self.sync_tracked();
            }
        }
        self.carry = iter.remainder().to_vec();
        out
    }

    /// Track exactly the PSI PIDs and the PIDs with section filters.
    fn sync_tracked(&mut self) {
        let mut wanted: HashSet<u16> = self.dvb.filtered_pids().into_iter().collect();
        wanted.insert(PAT_PID);
        wanted.extend(self.pmt_pids.keys().copied());

        let stale: Vec<u16> = self
            .assembler
            .tracked()
            .filter(|pid| !wanted.contains(pid))
            .collect();
        for pid in stale {
            trace!("Untracking PID 0x{:04X}", pid);
            self.assembler.untrack(pid);
        }
        for pid in wanted {
            if !self.assembler.is_tracked(pid) {
                trace!("Tracking PID 0x{:04X}", pid);
                self.assembler.track(pid);
            }
        }
    }

    fn on_pat(&mut self, raw: &[u8]) {
        let section = match Section::parse(raw) {
            Ok(s) if s.header.table_id == table_id::PAT => s,
            Ok(_) => return,
            Err(e) => {
                debug!("Dropping PAT section: {}", e);
                return;
            }
        };
        let programs = parse_pat(section.payload);
        let pmt_pids: HashMap<u16, u16> = programs
            .into_iter()
            .filter(|(program, _)| self.program.map_or(true, |p| p == *program))
            .map(|(program, pid)| (pid, program))
            .collect();
        if pmt_pids != self.pmt_pids {
            info!("PAT: {} program(s) followed", pmt_pids.len());
            self.pmt_pids = pmt_pids;
            self.pmt_versions.clear();
        }
    }

    fn on_pmt(&mut self, pid: u16, raw: &[u8]) {
        let section = match Section::parse(raw) {
            Ok(s) if s.header.table_id == table_id::PMT => s,
            Ok(_) => return,
            Err(e) => {
                debug!("PID 0x{:04X}: dropping PMT section: {}", pid, e);
                return;
            }
        };
        let program = section.header.table_id_extension;
        let version = section.header.version_number;
        if self.pmt_versions.get(&program) == Some(&version) {
            return;
        }
        let streams = match parse_pmt(section.payload) {
            Ok(streams) => streams,
            Err(e) => {
                warn!("PMT of program {}: {}", program, e);
                return;
            }
        };
        self.pmt_versions.insert(program, version);

        let tags: HashMap<u16, u16> = streams
            .iter()
            .filter_map(|s| s.component_tag.map(|t| (t as u16, s.elementary_pid)))
            .collect();
        info!(
            "PMT of program {} v{}: {} stream(s), {} tagged",
            program,
            version,
            streams.len(),
            tags.len()
        );
        self.dvb.set_assoc_tags(program, tags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsmcc_protocol::testing;
    use dsmcc_protocol::SectionFilter;
    use dsmcc_carousel::DvbStack;

    /// Split a section into TS packets on `pid`, counting from `cc`.
    fn packetize(pid: u16, mut cc: u8, section: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut rest = section;
        let mut first = true;
        while first || !rest.is_empty() {
            let mut packet = vec![0x47, ((pid >> 8) as u8) & 0x1F, pid as u8, 0x10 | cc];
            if first {
                packet[1] |= 0x40;
                packet.push(0);
            }
            let take = rest.len().min(188 - packet.len());
            packet.extend_from_slice(&rest[..take]);
            packet.resize(188, 0xFF);
            rest = &rest[take..];
            out.extend(packet);
            first = false;
            cc = (cc + 1) & 0x0F;
        }
        out
    }

    fn pmt_payload(streams: &[(u8, u16, Option<u8>)]) -> Vec<u8> {
        let mut payload = vec![0xE1, 0x00, 0xF0, 0x00];
        for (stream_type, pid, tag) in streams {
            payload.push(*stream_type);
            payload.push(0xE0 | (pid >> 8) as u8);
            payload.push(*pid as u8);
            match tag {
                Some(tag) => payload.extend([0xF0, 3, STREAM_IDENTIFIER_DESCRIPTOR, 1, *tag]),
                None => payload.extend([0xF0, 0]),
            }
        }
        payload
    }

    #[test]
    fn test_parse_pat() {
        let payload = [0x00, 0x00, 0xE0, 0x10, 0x04, 0x08, 0xE1, 0xF0];
        assert_eq!(parse_pat(&payload), vec![(0x0408, 0x01F0)]);
    }

    #[test]
    fn test_parse_pmt_component_tags() {
        let payload = pmt_payload(&[(0x1B, 0x0100, None), (0x0B, 0x0140, Some(0x40))]);
        let streams = parse_pmt(&payload).unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].component_tag, None);
        assert_eq!(streams[1].elementary_pid, 0x0140);
        assert_eq!(streams[1].component_tag, Some(0x40));

        let mut truncated = payload.clone();
        truncated.truncate(payload.len() - 2);
        assert!(parse_pmt(&truncated).is_err());
    }

    #[test]
    fn test_psi_maps_assoc_tags() {
        let dvb = Arc::new(SoftwareDvb::new());
        let mut demux = Demux::new(4096, dvb.clone(), None);

        let pat = testing::section(table_id::PAT, 1, 0, &[0x04, 0x08, 0xE1, 0xF0]);
        demux.push(&packetize(PAT_PID, 0, &pat));

        let pmt = testing::section(
            table_id::PMT,
            0x0408,
            1,
            &pmt_payload(&[(0x0B, 0x0140, Some(0x40))]),
        );
        demux.push(&packetize(0x01F0, 0, &pmt));
        assert_eq!(dvb.get_pid_for_assoc_tag(0x40), Some(0x0140));
        assert_eq!(dvb.get_pid_for_assoc_tag(0x41), None);
    }

    #[test]
    fn test_sections_follow_filters() {
        let dvb = Arc::new(SoftwareDvb::new());
        let mut demux = Demux::new(4096, dvb.clone(), None);
        let gateway = testing::ior(b"srg\0", 1, 1, &[0, 0, 0, 1], 0, 0x8000_0002, 0);
        let dsi = testing::dsi_object_section(0x8000_0000, &gateway);
        assert!(demux.push(&packetize(0x0140, 0, &dsi)).is_empty());
        dvb.add_section_filter(0x0140, &SectionFilter::dsi());
        let sections = demux.push(&packetize(0x0140, 1, &dsi));
        assert_eq!(sections, vec![(0x0140, Bytes::from(dsi.clone()))]);

        // Split across chunks.
        let stream = packetize(0x0140, 2, &dsi);
        assert!(demux.push(&stream[..100]).is_empty());
        assert_eq!(demux.push(&stream[100..]).len(), 1);
        assert_eq!(demux.packets(), 3);
    }
}
