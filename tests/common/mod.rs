#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use sniff::dns::ReverseResolver;

pub const BASE_TS: u32 = 1_700_000_000;

/// A frame plus the capture timestamp it is written with.
pub struct TestFrame {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub data: Vec<u8>,
}

fn ethernet(src: Ipv4Addr) -> Vec<u8> {
    let host = src.octets()[3];
    vec![0x02, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, host, 0x08, 0x00]
}

fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, body_len: usize) -> Vec<u8> {
    let total = (20 + body_len) as u16;
    let mut header = vec![0x45, 0];
    header.extend_from_slice(&total.to_be_bytes());
    header.extend_from_slice(&[0, 0, 0x40, 0, 64, proto, 0, 0]);
    header.extend_from_slice(&src.octets());
    header.extend_from_slice(&dst.octets());
    header
}

/// Ethernet/IPv4/TCP with `flags`, padded with `payload_len` bytes.
pub fn tcp(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, flags: u8, payload_len: usize) -> Vec<u8> {
    let mut data = ethernet(src);
    data.extend(ipv4_header(src, dst, 6, 20 + payload_len));
    data.extend_from_slice(&src_port.to_be_bytes());
    data.extend_from_slice(&dst_port.to_be_bytes());
    data.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, flags, 0xff, 0xff, 0, 0, 0, 0]);
    data.resize(data.len() + payload_len, 0x61);
    data
}

pub fn udp(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, payload_len: usize) -> Vec<u8> {
    let mut data = ethernet(src);
    data.extend(ipv4_header(src, dst, 17, 8 + payload_len));
    data.extend_from_slice(&src_port.to_be_bytes());
    data.extend_from_slice(&dst_port.to_be_bytes());
    data.extend_from_slice(&((8 + payload_len) as u16).to_be_bytes());
    data.extend_from_slice(&[0, 0]);
    data.resize(data.len() + payload_len, 0);
    data
}

/// ICMP echo request.
pub fn icmp(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    let mut data = ethernet(src);
    data.extend(ipv4_header(src, dst, 1, 8));
    data.extend_from_slice(&[8, 0, 0, 0, 0, 1, 0, 1]);
    data
}

pub fn at(offset_ms: u32, data: Vec<u8>) -> TestFrame {
    TestFrame { ts_sec: BASE_TS + offset_ms / 1000, ts_usec: (offset_ms % 1000) * 1000, data }
}

/// Classic little-endian pcap with an Ethernet link type.
pub fn write_pcap(path: &Path, frames: &[TestFrame]) {
    let mut out = Vec::new();
    out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&65535u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    for frame in frames {
        out.extend_from_slice(&frame.ts_sec.to_le_bytes());
        out.extend_from_slice(&frame.ts_usec.to_le_bytes());
        out.extend_from_slice(&(frame.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(frame.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&frame.data);
    }
    fs::write(path, out).unwrap();
}

pub fn v4(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

/// Resolver answering from a fixed table, `None` for everything else.
#[derive(Default)]
pub struct TableResolver(pub HashMap<IpAddr, String>);

impl TableResolver {
    pub fn with(entries: &[(&str, &str)]) -> Self {
        TableResolver(entries.iter().map(|(ip, name)| (ip.parse().unwrap(), name.to_string())).collect())
    }
}

impl ReverseResolver for TableResolver {
    fn reverse(&self, ip: IpAddr) -> Option<String> {
        self.0.get(&ip).cloned()
    }
}
