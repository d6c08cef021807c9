//! Traffic classes and the local policy that maps priorities and DSCP code points onto them.

use crate::error::{SockError, SockResult};

/// Internal traffic class used for class-based send shaping.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrafficClass {
    /// Background system-initiated.
    BkSys,
    /// Background.
    Bk,
    /// Best effort.
    #[default]
    Be,
    /// Responsive data.
    Rd,
    /// Operations, administration and management.
    Oam,
    /// Multimedia audio/video streaming.
    Av,
    /// Responsive multimedia audio/video.
    Rv,
    /// Interactive video.
    Vi,
    /// Interactive voice.
    Vo,
    /// Network control.
    Ctl,
}

const ALL: [TrafficClass; 10] = [
    TrafficClass::BkSys,
    TrafficClass::Bk,
    TrafficClass::Be,
    TrafficClass::Rd,
    TrafficClass::Oam,
    TrafficClass::Av,
    TrafficClass::Rv,
    TrafficClass::Vi,
    TrafficClass::Vo,
    TrafficClass::Ctl,
];

impl TrafficClass {
    /// Numeric value carried by the `SO_TRAFFIC_CLASS` option.
    pub fn value(self) -> i32 {
        match self {
            TrafficClass::BkSys => 100,
            TrafficClass::Bk => 200,
            TrafficClass::Be => 0,
            TrafficClass::Rd => 300,
            TrafficClass::Oam => 400,
            TrafficClass::Av => 500,
            TrafficClass::Rv => 600,
            TrafficClass::Vi => 700,
            TrafficClass::Vo => 800,
            TrafficClass::Ctl => 900,
        }
    }

    /// Maps a priority value to a class.
    ///
    /// The legacy values 0..=3 (best effort, background, video, voice) are accepted next to the
    /// numeric value of every class.
    pub fn from_priority(priority: i32) -> SockResult<Self> {
        match priority {
            1 => Ok(TrafficClass::Bk),
            2 => Ok(TrafficClass::Vi),
            3 => Ok(TrafficClass::Vo),
            value => ALL
                .iter()
                .copied()
                .find(|tc| tc.value() == value)
                .ok_or(SockError::InvalidArgument),
        }
    }

    /// Maps a 6-bit DSCP code point to a class. Bits above the DSCP field are ignored.
    pub fn from_dscp(dscp: u8) -> Self {
        match dscp & 0x3f {
            0x08..=0x17 => TrafficClass::Bk,
            0x20..=0x2f => TrafficClass::Vi,
            0x30..=0x3f => TrafficClass::Vo,
            _ => TrafficClass::Be,
        }
    }

    /// Position of the class in the service-class ladder, lowest first.
    pub fn service_class_index(self) -> usize {
        self as usize
    }

    /// Classes that only privileged sockets may select.
    pub fn requires_privilege(self) -> bool {
        matches!(self, TrafficClass::BkSys | TrafficClass::Ctl)
    }
}
