//! Format info tables and format-set negotiation for DRM formats.

use indexmap::{IndexMap, IndexSet};

use super::{Format, Fourcc, Modifier};

macro_rules! format_tables {
    (
        $($fourcc: ident {
            $(opaque: $opaque: ident,)?
            alpha: $alpha: expr,
            bpp: $bpp: expr,
            depth: $depth: expr $(,)?
        }),* $(,)?
    ) => {
        /// Returns the opaque alternative of the specified format.
        ///
        /// If the format has an alpha channel, this may return the corresponding opaque format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_opaque(fourcc: Fourcc) -> Option<Fourcc> {
            match fourcc {
                $($(
                    Fourcc::$fourcc => Some(Fourcc::$opaque),
                )?)*
                _ => None,
            }
        }

        /// Returns true if the format has an alpha channel.
        ///
        /// Unknown formats will always return `false`.
        pub const fn has_alpha(fourcc: Fourcc) -> bool {
            match fourcc {
                $(
                    Fourcc::$fourcc => $alpha,
                )*
                _ => false,
            }
        }

        /// Returns the bits per pixel of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_bpp(fourcc: Fourcc) -> Option<usize> {
            match fourcc {
                $(Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        /// Returns the depth of the specified format
        /// (excluding padding or non-alpha "X" parts of the format).
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_depth(fourcc: Fourcc) -> Option<usize> {
            match fourcc {
                $(Fourcc::$fourcc => Some($depth),)*
                _ => None,
            }
        }
    };
}

format_tables! {
    Argb8888 {
        opaque: Xrgb8888,
        alpha: true,
        bpp: 32,
        depth: 32,
    },
    Xrgb8888 {
        alpha: false,
        bpp: 32,
        depth: 24,
    },
    Abgr8888 {
        opaque: Xbgr8888,
        alpha: true,
        bpp: 32,
        depth: 32,
    },
    Xbgr8888 {
        alpha: false,
        bpp: 32,
        depth: 24,
    },
    Rgb888 {
        alpha: false,
        bpp: 24,
        depth: 24,
    },
    Bgr888 {
        alpha: false,
        bpp: 24,
        depth: 24,
    },
    Rgb565 {
        alpha: false,
        bpp: 16,
        depth: 16,
    },
    Argb2101010 {
        opaque: Xrgb2101010,
        alpha: true,
        bpp: 32,
        depth: 32,
    },
    Xrgb2101010 {
        alpha: false,
        bpp: 32,
        depth: 30,
    },
    Abgr2101010 {
        opaque: Xbgr2101010,
        alpha: true,
        bpp: 32,
        depth: 32,
    },
    Xbgr2101010 {
        alpha: false,
        bpp: 32,
        depth: 30,
    },
    Abgr16161616 {
        opaque: Xbgr16161616,
        alpha: true,
        bpp: 64,
        depth: 64,
    },
    Xbgr16161616 {
        alpha: false,
        bpp: 64,
        depth: 48,
    },
    Abgr16161616f {
        opaque: Xbgr16161616f,
        alpha: true,
        bpp: 64,
        depth: 64,
    },
    Xbgr16161616f {
        alpha: false,
        bpp: 64,
        depth: 48,
    },
}

/// The natural bit depth per color channel of a format, used to pick `max_bpc`
pub const fn max_bpc_for_format(fourcc: Fourcc) -> u64 {
    match fourcc {
        Fourcc::Xrgb2101010 | Fourcc::Argb2101010 | Fourcc::Xbgr2101010 | Fourcc::Abgr2101010 => 10,
        Fourcc::Xbgr16161616F | Fourcc::Abgr16161616F | Fourcc::Xbgr16161616 | Fourcc::Abgr16161616 => 16,
        _ => 8,
    }
}

/// A set of supported (format, modifier) pairs, as advertised by planes and renderers
///
/// Buffer negotiation intersects these sets: the swapchain render format is
/// picked from the intersection of the primary plane's and the renderer's set.
#[derive(Debug, Default, Clone)]
pub struct FormatSet {
    formats: IndexMap<Fourcc, IndexSet<Modifier>>,
}

impl FormatSet {
    /// Create an empty format set
    pub fn new() -> Self {
        Default::default()
    }

    /// Add a (format, modifier) pair to the set
    pub fn add(&mut self, fourcc: Fourcc, modifier: Modifier) {
        self.formats.entry(fourcc).or_default().insert(modifier);
    }

    /// Check whether the set contains the given (format, modifier) pair
    pub fn has(&self, fourcc: Fourcc, modifier: Modifier) -> bool {
        self.formats
            .get(&fourcc)
            .map(|mods| mods.contains(&modifier))
            .unwrap_or(false)
    }

    /// Check whether the set contains the format with any modifier
    pub fn has_format(&self, fourcc: Fourcc) -> bool {
        self.formats.contains_key(&fourcc)
    }

    /// Returns true if the set holds no formats
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// The fourcc codes in this set
    pub fn codes(&self) -> impl Iterator<Item = Fourcc> + '_ {
        self.formats.keys().copied()
    }

    /// The modifiers supported for a given format
    pub fn modifiers_for(&self, fourcc: Fourcc) -> impl Iterator<Item = Modifier> + '_ {
        self.formats
            .get(&fourcc)
            .into_iter()
            .flat_map(|mods| mods.iter().copied())
    }

    /// Iterate all (format, modifier) pairs in this set
    pub fn iter(&self) -> impl Iterator<Item = Format> + '_ {
        self.formats.iter().flat_map(|(code, mods)| {
            mods.iter().map(|modifier| Format {
                code: *code,
                modifier: *modifier,
            })
        })
    }

    /// Compute the set of pairs present in both sets
    pub fn intersect(&self, other: &FormatSet) -> FormatSet {
        let mut out = FormatSet::new();
        for format in self.iter() {
            if other.has(format.code, format.modifier) {
                out.add(format.code, format.modifier);
            }
        }
        out
    }

    /// Merge another set into this one
    pub fn union_with(&mut self, other: &FormatSet) {
        for format in other.iter() {
            self.add(format.code, format.modifier);
        }
    }
}

impl FromIterator<Format> for FormatSet {
    fn from_iter<T: IntoIterator<Item = Format>>(iter: T) -> Self {
        let mut set = FormatSet::new();
        for format in iter {
            set.add(format.code, format.modifier);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_substitute_strips_alpha() {
        assert_eq!(get_opaque(Fourcc::Argb8888), Some(Fourcc::Xrgb8888));
        assert_eq!(get_opaque(Fourcc::Xrgb8888), None);
        assert!(has_alpha(Fourcc::Argb8888));
        assert!(!has_alpha(Fourcc::Xrgb8888));
    }

    #[test]
    fn intersect_keeps_common_pairs() {
        let mut a = FormatSet::new();
        a.add(Fourcc::Argb8888, Modifier::Linear);
        a.add(Fourcc::Argb8888, Modifier::Invalid);
        a.add(Fourcc::Xrgb8888, Modifier::Linear);

        let mut b = FormatSet::new();
        b.add(Fourcc::Argb8888, Modifier::Linear);
        b.add(Fourcc::Rgb565, Modifier::Linear);

        let i = a.intersect(&b);
        assert!(i.has(Fourcc::Argb8888, Modifier::Linear));
        assert!(!i.has(Fourcc::Argb8888, Modifier::Invalid));
        assert!(!i.has_format(Fourcc::Xrgb8888));
        assert!(!i.has_format(Fourcc::Rgb565));
    }

    #[test]
    fn max_bpc_tracks_component_depth() {
        assert_eq!(max_bpc_for_format(Fourcc::Xrgb8888), 8);
        assert_eq!(max_bpc_for_format(Fourcc::Xrgb2101010), 10);
        assert_eq!(max_bpc_for_format(Fourcc::Abgr16161616F), 16);
    }
}
