//! Halo catalogs consumed by the aggregator

use serde::{Deserialize, Serialize};

/// One halo of a sampled catalog
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Halo {
    /// Comoving position (Mpc), wrapped into the box when gridded
    pub position: [f64; 3],
    /// Halo mass (Msun); zero marks a halo cut from the catalog
    pub mass: f64,
    /// Standard-normal draw for the stellar-mass scatter
    pub star_rng: f32,
    /// Standard-normal draw for the star-formation-rate scatter
    pub sfr_rng: f32,
    /// Standard-normal draw for the X-ray luminosity scatter
    pub xray_rng: f32,
}

impl Halo {
    /// Halo without scatter
    pub fn new(position: [f64; 3], mass: f64) -> Self {
        Self {
            position,
            mass,
            star_rng: 0.0,
            sfr_rng: 0.0,
            xray_rng: 0.0,
        }
    }

    /// True for the zero-mass sentinel
    #[inline]
    pub fn is_excluded(&self) -> bool {
        self.mass == 0.0
    }
}

/// Halos of one redshift
///
/// The random draws are redshift-invariant: a halo carries the same three
/// numbers through every step it survives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HaloCatalog {
    pub redshift: f64,
    halos: Vec<Halo>,
}

impl HaloCatalog {
    pub fn new(redshift: f64, halos: Vec<Halo>) -> Self {
        Self { redshift, halos }
    }

    pub fn push(&mut self, halo: Halo) {
        self.halos.push(halo);
    }

    pub fn len(&self) -> usize {
        self.halos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.halos.is_empty()
    }

    pub fn as_slice(&self) -> &[Halo] {
        &self.halos
    }

    pub fn iter(&self) -> impl Iterator<Item = &Halo> {
        self.halos.iter()
    }

    /// Number of zero-mass entries
    pub fn n_excluded(&self) -> usize {
        self.halos.iter().filter(|h| h.is_excluded()).count()
    }

    /// Same catalog at `redshift` with new halo positions
    ///
    /// # Panics
    ///
    /// Panics if `positions` does not have one entry per halo
    pub fn with_positions(&self, redshift: f64, positions: Vec<[f64; 3]>) -> Self {
        assert_eq!(
            positions.len(),
            self.halos.len(),
            "One position per halo required"
        );
        let halos = self
            .halos
            .iter()
            .zip(positions)
            .map(|(h, position)| Halo { position, ..*h })
            .collect();
        Self { redshift, halos }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excluded_count() {
        let mut catalog = HaloCatalog::new(8.0, vec![Halo::new([1.0, 2.0, 3.0], 1e10)]);
        catalog.push(Halo::new([0.0; 3], 0.0));
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.n_excluded(), 1);
    }

    #[test]
    fn test_moved_catalog_keeps_draws() {
        let mut halo = Halo::new([1.0, 2.0, 3.0], 1e10);
        halo.star_rng = 0.7;
        let catalog = HaloCatalog::new(9.0, vec![halo]);
        let moved = catalog.with_positions(8.5, vec![[4.0, 5.0, 6.0]]);
        assert_eq!(moved.redshift, 8.5);
        assert_eq!(moved.as_slice()[0].position, [4.0, 5.0, 6.0]);
        assert_eq!(moved.as_slice()[0].star_rng, 0.7);
    }

    #[test]
    #[should_panic(expected = "One position per halo")]
    fn test_position_count_mismatch() {
        let catalog = HaloCatalog::new(9.0, vec![Halo::new([0.0; 3], 1e9)]);
        let _ = catalog.with_positions(8.0, vec![]);
    }
}
