use std::{fmt, net::IpAddr};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReferenceId(u32);

impl ReferenceId {
    /// 127.127.1.1, used when the local clock acts as reference
    pub const LOCAL: ReferenceId = ReferenceId(0x7F7F0101);
    /// Reference set through a manual time update
    pub const MANUAL: ReferenceId = ReferenceId(u32::from_be_bytes(*b"MANU"));
    pub const NONE: ReferenceId = ReferenceId(0);

    pub fn from_ip(addr: IpAddr) -> ReferenceId {
        match addr {
            IpAddr::V4(addr) => ReferenceId(u32::from_be_bytes(addr.octets())),
            IpAddr::V6(addr) => {
                let digest = Md5::digest(addr.octets());
                ReferenceId(u32::from_be_bytes([
                    digest[0], digest[1], digest[2], digest[3],
                ]))
            }
        }
    }

    pub const fn from_int(value: u32) -> ReferenceId {
        ReferenceId(value)
    }

    pub const fn to_int(self) -> u32 {
        self.0
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bits: [u8; 4]) -> ReferenceId {
        ReferenceId(u32::from_be_bytes(bits))
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referenceid_from_ipv4() {
        let ip: IpAddr = "12.34.56.78".parse().unwrap();
        let rep = [12, 34, 56, 78];
        let a = ReferenceId::from_ip(ip);
        let b = ReferenceId::from_bytes(rep);
        assert_eq!(a, b);
    }

    #[test]
    fn referenceid_from_ipv6_is_stable() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        let a = ReferenceId::from_ip(ip);
        let b = ReferenceId::from_ip(ip);
        assert_eq!(a, b);
        assert_ne!(a, ReferenceId::from_ip("2001:db8::2".parse().unwrap()));
    }

    #[test]
    fn referenceid_display() {
        assert_eq!(ReferenceId::LOCAL.to_string(), "7F7F0101");
        assert_eq!(ReferenceId::MANUAL.to_bytes(), *b"MANU");
    }
}
