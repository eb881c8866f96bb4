//! Cell geometry from membrane composition.
//!
//! Surface area is the sum of lipid counts times their headgroup areas plus
//! membrane-protein counts times a fixed area per protein. The cell is
//! treated as a sphere: the surface area fixes the radius, and the radius
//! fixes the volume used for every count/concentration conversion.

use crate::error::{Engine, SimError, SimResult, Violation};
use crate::network::ReactionNetwork;
use crate::species::{SpeciesId, SpeciesState};
use cell_common::{CellConfig, ConfigError};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Litres per cubic nanometre.
const LITRES_PER_NM3: f64 = 1.0e-24;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellGeometry {
    pub surface_area_nm2: f64,
    pub radius_nm: f64,
    pub volume_l: f64,
}

impl CellGeometry {
    pub fn from_surface_area(surface_area_nm2: f64) -> Self {
        let radius_nm = (surface_area_nm2 / (4.0 * PI)).sqrt();
        CellGeometry {
            surface_area_nm2,
            radius_nm,
            volume_l: sphere_volume_l(radius_nm),
        }
    }

    pub fn from_radius(radius_nm: f64) -> Self {
        CellGeometry {
            surface_area_nm2: 4.0 * PI * radius_nm * radius_nm,
            radius_nm,
            volume_l: sphere_volume_l(radius_nm),
        }
    }
}

pub fn sphere_volume_l(radius_nm: f64) -> f64 {
    4.0 / 3.0 * PI * radius_nm.powi(3) * LITRES_PER_NM3
}

/// Maps lipid and membrane-protein counts to geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct GrowthModel {
    /// Lipid species with their headgroup area.
    lipids: Vec<(SpeciesId, f64)>,
    membrane_proteins: Vec<SpeciesId>,
    protein_area_nm2: f64,
}

impl GrowthModel {
    pub fn new(
        network: &ReactionNetwork,
        lipids: &[SpeciesId],
        membrane_proteins: &[SpeciesId],
        cell: &CellConfig,
    ) -> Result<Self, ConfigError> {
        for name in cell.lipid_headgroup_area_nm2.keys() {
            if network.lookup(name).is_none() {
                return Err(ConfigError::UnknownSpecies(name.clone()));
            }
        }
        let lipids = lipids
            .iter()
            .map(|id| {
                let name = network.name(*id);
                match cell.lipid_headgroup_area_nm2.get(name) {
                    Some(area) => Ok((*id, *area)),
                    None => Err(ConfigError::InvalidValue {
                        field: format!("cell.lipid_headgroup_area_nm2.{}", name),
                        reason: "missing headgroup area for lipid species".to_string(),
                    }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GrowthModel {
            lipids,
            membrane_proteins: membrane_proteins.to_vec(),
            protein_area_nm2: cell.membrane_protein_area_nm2,
        })
    }

    pub fn protein_area_nm2(&self, counts: &[u64]) -> f64 {
        self.membrane_proteins.iter().map(|id| counts[id.index()] as f64).sum::<f64>() * self.protein_area_nm2
    }

    pub fn surface_area_nm2(&self, counts: &[u64]) -> f64 {
        let lipid_area: f64 = self.lipids.iter().map(|(id, area)| counts[id.index()] as f64 * area).sum();
        lipid_area + self.protein_area_nm2(counts)
    }

    pub fn geometry(&self, counts: &[u64]) -> CellGeometry {
        CellGeometry::from_surface_area(self.surface_area_nm2(counts))
    }

    /// Lipid counts that, together with the current membrane proteins, give a
    /// sphere of `radius_nm`. `shares` splits the lipid area between classes.
    pub fn lipids_for_radius(
        &self,
        radius_nm: f64,
        counts: &[u64],
        shares: &[(SpeciesId, f64)],
    ) -> Result<Vec<(SpeciesId, u64)>, ConfigError> {
        let target = CellGeometry::from_radius(radius_nm).surface_area_nm2;
        let lipid_area = target - self.protein_area_nm2(counts);
        if !(lipid_area > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "cell.initial_radius_nm".to_string(),
                reason: format!("membrane proteins alone cover more than a {} nm sphere", radius_nm),
            });
        }
        let total_share: f64 = shares.iter().map(|(_, s)| s).sum();
        shares
            .iter()
            .map(|(id, share)| {
                let per_lipid = self
                    .lipids
                    .iter()
                    .find(|(lipid, _)| lipid == id)
                    .map(|(_, area)| *area)
                    .ok_or_else(|| ConfigError::InvalidValue {
                        field: "cell.lipid_headgroup_area_nm2".to_string(),
                        reason: format!("species {} is not a tracked lipid", id),
                    })?;
                Ok((*id, (lipid_area * share / total_share / per_lipid).round() as u64))
            })
            .collect()
    }

    /// Recomputes geometry after a macro-step. The volume may never shrink.
    pub fn update(&self, state: &SpeciesState, previous: &CellGeometry, time_sec: f64) -> SimResult<CellGeometry> {
        state.require_owner(Engine::Stochastic, time_sec)?;
        let next = self.geometry(state.counts());
        if next.volume_l < previous.volume_l {
            return Err(SimError::invariant(
                time_sec,
                Violation::DecreasingVolume { previous_l: previous.volume_l, current_l: next.volume_l },
            ));
        }
        Ok(next)
    }
}
