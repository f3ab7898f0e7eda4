//! Speaker layouts for sound buffers kept in shared memory.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelMode {
    #[default]
    Unknown,
    Mono,
    Stereo,
    /// Left, center, right.
    Stereo30,
    /// Two front, two rear.
    #[allow(non_camel_case_types)]
    Surround40_2F2R,
    Surround50,
    Surround51,
}

impl ChannelMode {
    /// The layout conventionally used for `channels` channels.
    pub const fn for_channels(channels: i32) -> Self {
        match channels {
            1 => Self::Mono,
            2 => Self::Stereo,
            3 => Self::Stereo30,
            4 => Self::Surround40_2F2R,
            5 => Self::Surround50,
            6 => Self::Surround51,
            _ => Self::Unknown,
        }
    }

    /// Number of channels, 0 for [`ChannelMode::Unknown`].
    pub const fn channels(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Mono => 1,
            Self::Stereo => 2,
            Self::Stereo30 => 3,
            Self::Surround40_2F2R => 4,
            Self::Surround50 => 5,
            Self::Surround51 => 6,
        }
    }
}
