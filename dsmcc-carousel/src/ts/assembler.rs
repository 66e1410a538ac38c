//! Private section reassembly from TS packets.
//!
//! One buffer per tracked PID. A payload unit start first completes the
//! section in progress with the bytes before the pointer target, then opens
//! a new one. Several sections may share a packet. Continuity gaps and
//! oversized sections discard the buffer until the next start marker.

use std::collections::HashMap;

use log::{debug, trace, warn};

use super::packet::TsPacket;

#[derive(Debug, Default)]
struct PidBuffer {
    data: Vec<u8>,
    last_cc: Option<u8>,
    /// A start marker has been seen since the last reset.
    started: bool,
}

impl PidBuffer {
    fn reset(&mut self) {
        self.data.clear();
        self.started = false;
    }
}

/// Rebuilds sections for the PIDs it tracks.
#[derive(Debug)]
pub struct SectionAssembler {
    max_section_size: usize,
    pids: HashMap<u16, PidBuffer>,
}

impl SectionAssembler {
    pub fn new(max_section_size: usize) -> Self {
        Self {
            max_section_size,
            pids: HashMap::new(),
        }
    }

    pub fn track(&mut self, pid: u16) {
        self.pids.entry(pid).or_default();
    }

    pub fn untrack(&mut self, pid: u16) {
        self.pids.remove(&pid);
    }

    pub fn is_tracked(&self, pid: u16) -> bool {
        self.pids.contains_key(&pid)
    }

    pub fn tracked(&self) -> impl Iterator<Item = u16> + '_ {
        self.pids.keys().copied()
    }

    /// Feed one packet; returns the sections it completed, in order.
    pub fn push(&mut self, packet: &TsPacket<'_>) -> Vec<Vec<u8>> {
        let header = packet.header;
        let max = self.max_section_size;
        let Some(buffer) = self.pids.get_mut(&header.pid) else {
            return Vec::new();
        };
        if header.transport_error {
            debug!("PID 0x{:04X}: dropping packet with transport error", header.pid);
            return Vec::new();
        }
        if header.is_scrambled() {
            trace!("PID 0x{:04X}: dropping scrambled packet", header.pid);
            return Vec::new();
        }
        if !header.has_payload() || packet.payload.is_empty() {
            return Vec::new();
        }

        let cc = header.continuity_counter;
        if let Some(last) = buffer.last_cc {
            if cc == last && !packet.discontinuity {
                trace!("PID 0x{:04X}: duplicate packet (cc {})", header.pid, cc);
                return Vec::new();
            }
            if cc != (last + 1) & 0x0F && !packet.discontinuity && buffer.started {
                debug!(
                    "PID 0x{:04X}: continuity error (expected {}, got {}), dropping {} buffered bytes",
                    header.pid,
                    (last + 1) & 0x0F,
                    cc,
                    buffer.data.len()
                );
                buffer.reset();
            }
        }
        buffer.last_cc = Some(cc);

        let mut sections = Vec::new();
        let payload = packet.payload;
        if header.payload_unit_start {
            let pointer = payload[0] as usize;
            if 1 + pointer > payload.len() {
                debug!("PID 0x{:04X}: pointer field {} past payload", header.pid, pointer);
                buffer.reset();
                return sections;
            }
            if buffer.started {
                append(buffer, &payload[1..1 + pointer], max, header.pid);
                drain_sections(buffer, &mut sections, max, header.pid);
                if !buffer.data.is_empty() {
                    debug!(
                        "PID 0x{:04X}: discarding {} bytes of an unfinished section",
                        header.pid,
                        buffer.data.len()
                    );
                }
            }
            buffer.data.clear();
            buffer.started = true;
            append(buffer, &payload[1 + pointer..], max, header.pid);
        } else if buffer.started {
            append(buffer, payload, max, header.pid);
        } else {
            return sections;
        }
        drain_sections(buffer, &mut sections, max, header.pid);
        sections
    }
}

fn append(buffer: &mut PidBuffer, bytes: &[u8], max: usize, pid: u16) {
    // A single section never exceeds `max`, and complete sections are
    // drained after every packet, so a longer buffer only holds stuffing
    // or garbage.
    let room = (max + super::packet::TS_PACKET_SIZE).saturating_sub(buffer.data.len());
    if bytes.len() > room {
        warn!(
            "PID 0x{:04X}: section buffer full, dropping {} bytes",
            pid,
            bytes.len() - room
        );
    }
    buffer.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
}

fn drain_sections(buffer: &mut PidBuffer, out: &mut Vec<Vec<u8>>, max: usize, pid: u16) {
    loop {
        if buffer.data.first() == Some(&0xFF) {
            // Stuffing up to the end of the packet.
            buffer.reset();
            return;
        }
        if buffer.data.len() < 3 {
            return;
        }
        let length = 3 + (((buffer.data[1] as usize) & 0x0F) << 8 | buffer.data[2] as usize);
        if length > max {
            warn!("PID 0x{:04X}: section of {} bytes exceeds {}, dropped", pid, length, max);
            buffer.reset();
            return;
        }
        if buffer.data.len() < length {
            return;
        }
        let rest = buffer.data.split_off(length);
        out.push(std::mem::replace(&mut buffer.data, rest));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::packet::{SYNC_BYTE, TS_PACKET_SIZE};

    /// Split sections into packets on `pid`, back to back.
    fn packetize(pid: u16, sections: &[Vec<u8>], cc_start: u8) -> Vec<[u8; TS_PACKET_SIZE]> {
        let mut stream = Vec::new();
        for s in sections {
            stream.extend_from_slice(s);
        }
        let mut packets = Vec::new();
        let mut offset = 0;
        let mut cc = cc_start;
        let mut starts: Vec<usize> = Vec::new();
        let mut acc = 0;
        for s in sections {
            starts.push(acc);
            acc += s.len();
        }
        while offset < stream.len() {
            let mut p = [0xFFu8; TS_PACKET_SIZE];
            p[0] = SYNC_BYTE;
            p[1] = (pid >> 8) as u8 & 0x1F;
            p[2] = pid as u8;
            p[3] = 0x10 | (cc & 0x0F);
            let end = offset + 184;
            let start_here = starts.iter().find(|s| **s >= offset && **s < end - 1).copied();
            let mut pos = 4;
            if let Some(start) = start_here {
                p[1] |= 0x40;
                p[pos] = (start - offset) as u8;
                pos += 1;
            }
            let n = (TS_PACKET_SIZE - pos).min(stream.len() - offset);
            p[pos..pos + n].copy_from_slice(&stream[offset..offset + n]);
            offset += n;
            packets.push(p);
            cc = (cc + 1) & 0x0F;
        }
        packets
    }

    fn section(len: usize, fill: u8) -> Vec<u8> {
        let mut s = vec![0x3C, 0xB0 | ((len - 3) >> 8) as u8, (len - 3) as u8];
        s.resize(len, fill);
        s
    }

    fn feed(asm: &mut SectionAssembler, packets: &[[u8; TS_PACKET_SIZE]]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for p in packets {
            out.extend(asm.push(&TsPacket::parse(p).unwrap()));
        }
        out
    }

    #[test]
    fn test_untracked_pid_is_ignored() {
        let mut asm = SectionAssembler::new(4096);
        let packets = packetize(0x100, &[section(20, 1)], 0);
        assert!(feed(&mut asm, &packets).is_empty());
    }

    #[test]
    fn test_single_packet_section() {
        let mut asm = SectionAssembler::new(4096);
        asm.track(0x100);
        let s = section(40, 7);
        let out = feed(&mut asm, &packetize(0x100, &[s.clone()], 0));
        assert_eq!(out, vec![s]);
    }

    #[test]
    fn test_section_spanning_packets_and_sharing_packets() {
        let mut asm = SectionAssembler::new(4096);
        asm.track(0x100);
        let sections = vec![section(500, 1), section(30, 2), section(1000, 3)];
        let out = feed(&mut asm, &packetize(0x100, &sections, 14));
        assert_eq!(out, sections);
    }

    #[test]
    fn test_continuity_gap_drops_section() {
        let mut asm = SectionAssembler::new(4096);
        asm.track(0x100);
        let sections = vec![section(500, 1), section(300, 2)];
        let mut packets = packetize(0x100, &sections, 0);
        // Lose the second packet of the first section.
        packets.remove(1);
        let out = feed(&mut asm, &packets);
        assert_eq!(out, vec![sections[1].clone()]);
    }

    #[test]
    fn test_duplicate_packet_is_ignored() {
        let mut asm = SectionAssembler::new(4096);
        asm.track(0x100);
        let s = section(300, 9);
        let mut packets = packetize(0x100, &[s.clone()], 0);
        packets.insert(1, packets[0]);
        assert_eq!(feed(&mut asm, &packets), vec![s]);
    }

    #[test]
    fn test_oversized_section_is_dropped() {
        let mut asm = SectionAssembler::new(256);
        asm.track(0x100);
        let sections = vec![section(400, 1), section(100, 2)];
        let out = feed(&mut asm, &packetize(0x100, &sections, 0));
        assert_eq!(out, vec![sections[1].clone()]);
    }
}
