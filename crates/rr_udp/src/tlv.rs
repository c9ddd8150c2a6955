use std::net::Ipv4Addr;

pub const TLV_MAX_LEN: usize = 255;

/// A RADIUS attribute value: one type octet and up to 255 payload bytes.
/// A zero-length attribute carries no payload at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    t: u8,
    value: Option<Vec<u8>>,
}

impl Tlv {
    pub fn new(t: u8, value: Option<&[u8]>) -> Option<Self> {
        match value {
            Some(v) if v.len() > TLV_MAX_LEN => None,
            Some(v) if !v.is_empty() => Some(Self {
                t,
                value: Some(v.to_vec()),
            }),
            _ => Some(Self { t, value: None }),
        }
    }

    pub fn t(&self) -> u8 {
        self.t
    }

    pub fn len(&self) -> u8 {
        self.value.as_ref().map_or(0, |v| v.len() as u8)
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Truncates or zero-extends the payload to `newlen` bytes.
    pub fn resize(&mut self, newlen: u8) {
        if newlen == self.len() {
            return;
        }
        if newlen == 0 {
            self.value = None;
            return;
        }
        let v = self.value.get_or_insert_with(Vec::new);
        v.resize(newlen as usize, 0);
    }

    /// Lossy text rendering of the payload; `None` when the value is absent.
    pub fn to_text(&self) -> Option<String> {
        self.value
            .as_ref()
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Big-endian interpretation of the first four payload bytes.
    pub fn to_u32(&self) -> Option<u32> {
        let v = self.value.as_deref()?;
        if v.len() < 4 {
            return None;
        }
        Some(u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
    }

    pub fn to_ipv4(&self) -> Option<Ipv4Addr> {
        let v = self.value.as_deref()?;
        if v.len() < 4 {
            return None;
        }
        Some(Ipv4Addr::new(v[0], v[1], v[2], v[3]))
    }
}

pub fn copy_tlv_list(tlvs: &[Tlv]) -> Vec<Tlv> {
    tlvs.to_vec()
}

/// Removes every attribute of type `t`, keeping the relative order of the rest.
pub fn remove_tlv_type(tlvs: &mut Vec<Tlv>, t: u8) {
    tlvs.retain(|tlv| tlv.t != t);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_copies_payload() {
        let bytes = [1u8, 2, 3];
        let tlv = Tlv::new(7, Some(&bytes)).expect("make tlv");
        assert_eq!(tlv.t(), 7);
        assert_eq!(tlv.len(), 3);
        assert_eq!(tlv.value(), Some(&bytes[..]));
    }

    #[test]
    fn zero_length_value_is_absent() {
        let tlv = Tlv::new(7, Some(&[])).expect("make tlv");
        assert!(tlv.is_empty());
        assert_eq!(tlv.len(), 0);
        assert_eq!(tlv.value(), None);

        let tlv = Tlv::new(7, None).expect("make tlv");
        assert!(tlv.is_empty());
    }

    #[test]
    fn rejects_oversize_payload() {
        let big = [0u8; 256];
        assert!(Tlv::new(1, Some(&big)).is_none());
        assert!(Tlv::new(1, Some(&big[..255])).is_some());
    }

    #[test]
    fn clone_equals_original() {
        let tlv = Tlv::new(26, Some(b"vendor")).expect("make tlv");
        assert_eq!(tlv.clone(), tlv);

        let empty = Tlv::new(26, None).expect("make tlv");
        assert_eq!(empty.clone(), empty);
    }

    #[test]
    fn equality_is_structural() {
        let a = Tlv::new(1, Some(b"abc")).expect("make tlv");
        let b = Tlv::new(1, Some(b"abc")).expect("make tlv");
        let c = Tlv::new(2, Some(b"abc")).expect("make tlv");
        let d = Tlv::new(1, Some(b"abd")).expect("make tlv");
        let e = Tlv::new(1, Some(b"ab")).expect("make tlv");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_ne!(a, e);
    }

    #[test]
    fn resize_truncates_and_extends() {
        let mut tlv = Tlv::new(1, Some(b"abcdef")).expect("make tlv");
        tlv.resize(3);
        assert_eq!(tlv.value(), Some(&b"abc"[..]));

        tlv.resize(5);
        assert_eq!(tlv.value(), Some(&[b'a', b'b', b'c', 0, 0][..]));

        tlv.resize(0);
        assert!(tlv.is_empty());

        // growing from absent yields zero fill
        tlv.resize(2);
        assert_eq!(tlv.value(), Some(&[0u8, 0][..]));
    }

    #[test]
    fn to_text_absent_is_none() {
        let tlv = Tlv::new(1, None).expect("make tlv");
        assert_eq!(tlv.to_text(), None);

        let tlv = Tlv::new(1, Some(b"staff")).expect("make tlv");
        assert_eq!(tlv.to_text().as_deref(), Some("staff"));
    }

    #[test]
    fn to_u32_is_big_endian() {
        let tlv = Tlv::new(1, Some(&[0x01, 0x02, 0x03, 0x04])).expect("make tlv");
        assert_eq!(
            tlv.to_u32(),
            Some((1 << 24) + (2 << 16) + (3 << 8) + 4)
        );

        let short = Tlv::new(1, Some(&[0x01, 0x02])).expect("make tlv");
        assert_eq!(short.to_u32(), None);
    }

    #[test]
    fn to_ipv4_formats_dotted_decimal() {
        let tlv = Tlv::new(8, Some(&[192, 0, 2, 17])).expect("make tlv");
        let addr = tlv.to_ipv4().expect("ipv4");
        assert_eq!(addr.to_string(), "192.0.2.17");

        let absent = Tlv::new(8, None).expect("make tlv");
        assert_eq!(absent.to_ipv4(), None);
    }

    #[test]
    fn copy_list_preserves_order_and_elements() {
        let list = vec![
            Tlv::new(1, Some(b"one")).unwrap(),
            Tlv::new(2, None).unwrap(),
            Tlv::new(1, Some(b"dup")).unwrap(),
        ];
        let copy = copy_tlv_list(&list);
        assert_eq!(copy, list);
    }

    #[test]
    fn remove_by_type_keeps_relative_order() {
        let mut list = vec![
            Tlv::new(1, Some(b"a")).unwrap(),
            Tlv::new(2, Some(b"b")).unwrap(),
            Tlv::new(1, Some(b"c")).unwrap(),
            Tlv::new(3, Some(b"d")).unwrap(),
            Tlv::new(1, None).unwrap(),
        ];
        remove_tlv_type(&mut list, 1);
        assert_eq!(
            list,
            vec![
                Tlv::new(2, Some(b"b")).unwrap(),
                Tlv::new(3, Some(b"d")).unwrap(),
            ]
        );

        remove_tlv_type(&mut list, 9);
        assert_eq!(list.len(), 2);
    }
}
