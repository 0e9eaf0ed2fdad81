//! Sampler state description
//!
//! A value type packed into 32 bits; the packed form keys the bindless
//! sampler map. Samplers themselves are created lazily by the bindless
//! manager and live for the device lifetime.

use ash::vk;

/// Texel filtering mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Filter {
    /// Nearest-texel
    #[default]
    Nearest = 0,
    /// Linear interpolation
    Linear = 1,
}

/// Mip level selection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum MipFilter {
    /// Nearest mip
    #[default]
    Nearest = 0,
    /// Trilinear blend between mips
    Linear = 1,
}

/// Texture coordinate wrap mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum AddressMode {
    /// Repeat the image
    #[default]
    Repeat = 0,
    /// Mirror on every repeat
    MirroredRepeat = 1,
    /// Clamp to the edge texel
    ClampToEdge = 2,
    /// Clamp to the border color
    ClampToBorder = 3,
}

/// Depth-compare operator for shadow samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum CompareOp {
    /// Comparison disabled
    #[default]
    Disabled = 0,
    /// value < reference
    Less = 1,
    /// value <= reference
    LessEqual = 2,
    /// value > reference
    Greater = 3,
    /// value >= reference
    GreaterEqual = 4,
    /// Always passes
    Always = 5,
}

/// Complete sampler description; packs into 32 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerState {
    /// Minification filter
    pub min_filter: Filter,
    /// Magnification filter
    pub mag_filter: Filter,
    /// Mip selection filter
    pub mip_filter: MipFilter,
    /// U coordinate wrap
    pub address_u: AddressMode,
    /// V coordinate wrap
    pub address_v: AddressMode,
    /// W coordinate wrap
    pub address_w: AddressMode,
    /// Anisotropy level (0 = off, otherwise 2/4/8/16)
    pub anisotropy: u32,
    /// Depth comparison
    pub compare: CompareOp,
}

impl SamplerState {
    /// Trilinear sampler with repeat addressing
    pub fn linear_repeat() -> Self {
        Self {
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            mip_filter: MipFilter::Linear,
            ..Default::default()
        }
    }

    /// Nearest sampler clamped to edges
    pub fn nearest_clamp() -> Self {
        Self {
            address_u: AddressMode::ClampToEdge,
            address_v: AddressMode::ClampToEdge,
            address_w: AddressMode::ClampToEdge,
            ..Default::default()
        }
    }

    /// Pack into the 32-bit map key.
    ///
    /// Layout: min (1) | mag (1) | mip (1) | u (2) | v (2) | w (2) |
    /// aniso log2 (3) | compare (3).
    pub fn pack(self) -> u32 {
        let aniso_log2 = if self.anisotropy == 0 {
            0
        } else {
            debug_assert!(self.anisotropy.is_power_of_two() && self.anisotropy <= 16);
            self.anisotropy.trailing_zeros() + 1
        };

        (self.min_filter as u32)
            | ((self.mag_filter as u32) << 1)
            | ((self.mip_filter as u32) << 2)
            | ((self.address_u as u32) << 3)
            | ((self.address_v as u32) << 5)
            | ((self.address_w as u32) << 7)
            | (aniso_log2 << 9)
            | ((self.compare as u32) << 12)
    }

    pub(crate) fn to_vk_create_info(self) -> vk::SamplerCreateInfo {
        let filter = |f: Filter| match f {
            Filter::Nearest => vk::Filter::NEAREST,
            Filter::Linear => vk::Filter::LINEAR,
        };
        let address = |mode: AddressMode| match mode {
            AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        };
        let compare = |op: CompareOp| match op {
            CompareOp::Disabled => vk::CompareOp::NEVER,
            CompareOp::Less => vk::CompareOp::LESS,
            CompareOp::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareOp::Greater => vk::CompareOp::GREATER,
            CompareOp::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
            CompareOp::Always => vk::CompareOp::ALWAYS,
        };

        vk::SamplerCreateInfo::builder()
            .min_filter(filter(self.min_filter))
            .mag_filter(filter(self.mag_filter))
            .mipmap_mode(match self.mip_filter {
                MipFilter::Nearest => vk::SamplerMipmapMode::NEAREST,
                MipFilter::Linear => vk::SamplerMipmapMode::LINEAR,
            })
            .address_mode_u(address(self.address_u))
            .address_mode_v(address(self.address_v))
            .address_mode_w(address(self.address_w))
            .anisotropy_enable(self.anisotropy > 0)
            .max_anisotropy(self.anisotropy.max(1) as f32)
            .compare_enable(self.compare != CompareOp::Disabled)
            .compare_op(compare(self.compare))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_distinguishes_states() {
        let mut keys = vec![
            SamplerState::default().pack(),
            SamplerState::linear_repeat().pack(),
            SamplerState::nearest_clamp().pack(),
            SamplerState {
                anisotropy: 16,
                ..SamplerState::linear_repeat()
            }
            .pack(),
            SamplerState {
                compare: CompareOp::LessEqual,
                ..SamplerState::default()
            }
            .pack(),
        ];
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 5);
    }

    #[test]
    fn test_pack_is_stable() {
        let state = SamplerState::linear_repeat();
        assert_eq!(state.pack(), state.pack());
    }

    #[test]
    fn test_anisotropy_levels_pack_uniquely() {
        let mut keys: Vec<u32> = [0u32, 2, 4, 8, 16]
            .iter()
            .map(|&anisotropy| {
                SamplerState {
                    anisotropy,
                    ..SamplerState::linear_repeat()
                }
                .pack()
            })
            .collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 5);
    }
}
