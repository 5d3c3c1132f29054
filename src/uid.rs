/* RDM unique identifiers: the 48-bit UID value type (16-bit ESTA
 * manufacturer id + 32-bit device id) and the ordered UidSet container
 * used throughout discovery and the registry. */

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/* Errors raised when parsing a UID from its `mmmm:dddddddd` literal. */
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UidParseError {
    #[error("UID literal must be of the form mmmm:dddddddd, got {0:?}")]
    BadShape(String),

    #[error("UID literal contains a non-hex field: {0:?}")]
    BadHex(String),
}

/// A 48-bit RDM unique identifier.
///
/// The first two bytes are the ESTA manufacturer id, the remaining four
/// the device id. UIDs order by manufacturer id, then device id, both
/// unsigned, and render as `mmmm:dddddddd` in lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid {
    manufacturer_id: u16,
    device_id: u32,
}

/* The manufacturer id that addresses every manufacturer. */
pub const ALL_MANUFACTURERS: u16 = 0xffff;

/* The device id that addresses every device of a manufacturer. */
pub const ALL_DEVICES: u32 = 0xffffffff;

/* Size of a UID in wire form. */
pub const UID_SIZE: usize = 6;

impl Uid {
    pub const fn new(manufacturer_id: u16, device_id: u32) -> Self {
        Self {
            manufacturer_id,
            device_id,
        }
    }

    /// The broadcast-all UID, `ffff:ffffffff`.
    pub const fn all_devices() -> Self {
        Self::new(ALL_MANUFACTURERS, ALL_DEVICES)
    }

    /// The vendorcast UID for a manufacturer, `mmmm:ffffffff`.
    pub const fn vendorcast(manufacturer_id: u16) -> Self {
        Self::new(manufacturer_id, ALL_DEVICES)
    }

    pub fn manufacturer_id(&self) -> u16 {
        self.manufacturer_id
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// True for both broadcast-all and vendorcast UIDs.
    pub fn is_broadcast(&self) -> bool {
        self.device_id == ALL_DEVICES
    }

    /// Whether a message addressed to `self` is directed to `uid`.
    ///
    /// True when the UIDs are equal, when `self` is broadcast-all, or when
    /// `self` is a vendorcast matching `uid`'s manufacturer.
    pub fn directed_to(&self, uid: &Uid) -> bool {
        *self == *uid
            || (self.is_broadcast()
                && (self.manufacturer_id == ALL_MANUFACTURERS
                    || self.manufacturer_id == uid.manufacturer_id))
    }

    pub fn to_u64(&self) -> u64 {
        (u64::from(self.manufacturer_id) << 32) | u64::from(self.device_id)
    }

    /// Big-endian wire form.
    pub fn pack(&self) -> [u8; UID_SIZE] {
        let mut buf = [0u8; UID_SIZE];
        buf[..2].copy_from_slice(&self.manufacturer_id.to_be_bytes());
        buf[2..].copy_from_slice(&self.device_id.to_be_bytes());
        buf
    }

    /// Construct from the big-endian wire form.
    pub fn from_bytes(data: &[u8; UID_SIZE]) -> Self {
        Self {
            manufacturer_id: u16::from_be_bytes([data[0], data[1]]),
            device_id: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
        }
    }
}

impl From<u64> for Uid {
    /* Only the low 48 bits are meaningful; the discovery engine does its
     * midpoint arithmetic in u64 space and converts back. */
    fn from(value: u64) -> Self {
        Self {
            manufacturer_id: (value >> 32) as u16,
            device_id: value as u32,
        }
    }
}

impl From<Uid> for u64 {
    fn from(value: Uid) -> Self {
        value.to_u64()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:08x}", self.manufacturer_id, self.device_id)
    }
}

impl FromStr for Uid {
    type Err = UidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mfr, dev) = s
            .split_once(':')
            .ok_or_else(|| UidParseError::BadShape(s.to_string()))?;
        if mfr.len() != 4 || dev.len() != 8 {
            return Err(UidParseError::BadShape(s.to_string()));
        }
        let manufacturer_id = u16::from_str_radix(mfr, 16)
            .map_err(|_| UidParseError::BadHex(s.to_string()))?;
        let device_id = u32::from_str_radix(dev, 16)
            .map_err(|_| UidParseError::BadHex(s.to_string()))?;
        Ok(Self {
            manufacturer_id,
            device_id,
        })
    }
}

/// An ordered set of UIDs.
///
/// Iteration is always ascending. The string form is the comma-separated
/// list of UID literals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UidSet {
    uids: BTreeSet<Uid>,
}

impl UidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    pub fn clear(&mut self) {
        self.uids.clear();
    }

    /* Returns true if the UID was not already present. */
    pub fn insert(&mut self, uid: Uid) -> bool {
        self.uids.insert(uid)
    }

    pub fn remove(&mut self, uid: &Uid) -> bool {
        self.uids.remove(uid)
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        self.uids.contains(uid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Uid> {
        self.uids.iter()
    }

    /// The UIDs present in either set.
    pub fn union(&self, other: &UidSet) -> UidSet {
        UidSet {
            uids: self.uids.union(&other.uids).copied().collect(),
        }
    }

    /// The UIDs in `self` that are not in `other`.
    pub fn difference(&self, other: &UidSet) -> UidSet {
        UidSet {
            uids: self.uids.difference(&other.uids).copied().collect(),
        }
    }
}

impl FromIterator<Uid> for UidSet {
    fn from_iter<I: IntoIterator<Item = Uid>>(iter: I) -> Self {
        Self {
            uids: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a UidSet {
    type Item = &'a Uid;
    type IntoIter = std::collections::btree_set::Iter<'a, Uid>;

    fn into_iter(self) -> Self::IntoIter {
        self.uids.iter()
    }
}

impl fmt::Display for UidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for uid in &self.uids {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{uid}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_accessors_and_order() {
        let uid = Uid::new(0x7a70, 0x2001);
        assert_eq!(uid.manufacturer_id(), 0x7a70);
        assert_eq!(uid.device_id(), 0x2001);

        let smaller_mfr = Uid::new(0x7a6f, 0xffffffff);
        let same_mfr_smaller_dev = Uid::new(0x7a70, 0x2000);
        assert!(smaller_mfr < uid);
        assert!(same_mfr_smaller_dev < uid);
        assert!(uid <= uid);
        assert_ne!(uid, smaller_mfr);
    }

    #[test]
    fn uid_string_round_trip() {
        let uid = Uid::new(0x7a70, 0x2001);
        assert_eq!(uid.to_string(), "7a70:00002001");
        assert_eq!("7a70:00002001".parse::<Uid>(), Ok(uid));

        assert_eq!(Uid::all_devices().to_string(), "ffff:ffffffff");

        assert!(matches!(
            "7a702001".parse::<Uid>(),
            Err(UidParseError::BadShape(_))
        ));
        assert!(matches!(
            "7a7:00002001".parse::<Uid>(),
            Err(UidParseError::BadShape(_))
        ));
        assert!(matches!(
            "7a70:0000200z".parse::<Uid>(),
            Err(UidParseError::BadHex(_))
        ));
    }

    #[test]
    fn uid_pack_round_trip() {
        let uid = Uid::new(0x0102, 0x03040506);
        let packed = uid.pack();
        assert_eq!(packed, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(Uid::from_bytes(&packed), uid);
    }

    #[test]
    fn uid_u64_round_trip() {
        let uid = Uid::new(0x7a70, 0x12345678);
        assert_eq!(uid.to_u64(), 0x7a70_1234_5678);
        assert_eq!(Uid::from(uid.to_u64()), uid);
    }

    #[test]
    fn directed_to() {
        let uid = Uid::new(0x7a70, 1);
        assert!(uid.directed_to(&uid));

        let broadcast = Uid::all_devices();
        assert!(broadcast.directed_to(&uid));

        let vendorcast = Uid::vendorcast(0x7a70);
        assert!(vendorcast.directed_to(&uid));

        let other_vendorcast = Uid::vendorcast(0x0808);
        assert!(!other_vendorcast.directed_to(&uid));

        /* A unicast UID is never directed at anyone else. */
        assert!(!uid.directed_to(&Uid::new(0x7a70, 2)));
    }

    #[test]
    fn broadcast_predicates() {
        assert!(Uid::all_devices().is_broadcast());
        assert!(Uid::vendorcast(0x7a70).is_broadcast());
        assert!(!Uid::new(0x7a70, 0x2001).is_broadcast());
    }

    #[test]
    fn set_operations() {
        let a: UidSet = [Uid::new(1, 1), Uid::new(1, 2), Uid::new(2, 1)]
            .into_iter()
            .collect();
        let b: UidSet = [Uid::new(1, 2), Uid::new(3, 7)].into_iter().collect();

        assert_eq!(a.len(), 3);
        assert!(a.contains(&Uid::new(1, 2)));
        assert!(!a.contains(&Uid::new(3, 7)));

        let union = a.union(&b);
        assert_eq!(union.len(), 4);

        let difference = b.difference(&a);
        assert_eq!(difference.len(), 1);
        assert!(difference.contains(&Uid::new(3, 7)));

        /* |A ∪ B| == |A| + |B \ A| */
        assert_eq!(union.len(), a.len() + b.difference(&a).len());
    }

    #[test]
    fn set_iteration_is_ascending() {
        let mut set = UidSet::new();
        set.insert(Uid::new(2, 1));
        set.insert(Uid::new(1, 9));
        set.insert(Uid::new(1, 2));

        let ordered: Vec<Uid> = set.iter().copied().collect();
        assert_eq!(
            ordered,
            vec![Uid::new(1, 2), Uid::new(1, 9), Uid::new(2, 1)]
        );

        assert_eq!(
            set.to_string(),
            "0001:00000002,0001:00000009,0002:00000001"
        );
    }

    #[test]
    fn set_insert_remove() {
        let mut set = UidSet::new();
        assert!(set.insert(Uid::new(1, 1)));
        assert!(!set.insert(Uid::new(1, 1)));
        assert!(set.remove(&Uid::new(1, 1)));
        assert!(!set.remove(&Uid::new(1, 1)));
        assert!(set.is_empty());
    }
}
