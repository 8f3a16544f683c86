use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    dsp::modulate::{apply_offset, route_contribution},
    engine::{
        params::{ParameterAddress, ParameterMetadata},
        sources::{ModSource, SourceReader},
    },
    error::EngineError,
};

/*
Modulation Matrix
=================

A registry of parameters plus, for each one, up to two routes:

    parameter           slot 0                   slot 1
    ─────────           ──────                   ──────
    filter.cutoff       lfo1   +40%  bipolar     mod-envelope  +25%
    osc2.frequency      osc1   +10%  bipolar     -

Resolving a parameter:

    no routes   →  base, untouched
    otherwise   →  offset = Σ contribution(source value, amount, polarity)
                   value  = apply_offset(base, offset, min, max, curve)

(see dsp/modulate.rs for the arithmetic).

Lazy Sources
------------

Reading a voice as a source costs a tap read per tick, so only sources that
appear in at least one route are read. The active source set is recomputed
on every route mutation; `refresh_source_values` reads exactly that set.

A parameter whose last route is removed disappears from the route map, which
is how callers know to restore its base value.
*/

pub const ROUTES_PER_PARAMETER: usize = 2;

/// One binding from a source to a parameter slot.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModulationRoute {
    pub source: ModSource,
    /// Depth in percent, -100 to +100.
    pub amount: f32,
    pub bipolar: bool,
}

type RouteSlots = [Option<ModulationRoute>; ROUTES_PER_PARAMETER];

#[derive(Debug, Default)]
pub struct ModulationMatrix {
    registry: BTreeMap<ParameterAddress, ParameterMetadata>,
    routes: BTreeMap<ParameterAddress, RouteSlots>,
    active_sources: BTreeSet<ModSource>,
    source_values: BTreeMap<ModSource, f32>,
}

impl ModulationMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// A matrix with every built-in parameter registered.
    pub fn with_defaults() -> Self {
        let mut matrix = Self::new();
        for meta in ParameterMetadata::defaults() {
            matrix.registry.insert(meta.address, meta);
        }
        matrix
    }

    pub fn register_parameter(&mut self, meta: ParameterMetadata) -> Result<(), EngineError> {
        if self.registry.contains_key(&meta.address) {
            return Err(EngineError::DuplicateParameter(meta.address));
        }
        self.registry.insert(meta.address, meta);
        Ok(())
    }

    pub fn metadata(&self, address: ParameterAddress) -> Option<&ParameterMetadata> {
        self.registry.get(&address)
    }

    pub fn parameters(&self) -> impl Iterator<Item = &ParameterMetadata> {
        self.registry.values()
    }

    fn check(&self, address: ParameterAddress, slot: usize) -> Result<(), EngineError> {
        if !self.registry.contains_key(&address) {
            return Err(EngineError::UnknownParameter(address));
        }
        if slot >= ROUTES_PER_PARAMETER {
            return Err(EngineError::RouteSlotOutOfRange { slot });
        }
        Ok(())
    }

    /// Bind `source` to `address` in `slot`, replacing whatever was there.
    pub fn add_route(
        &mut self,
        address: ParameterAddress,
        slot: usize,
        source: ModSource,
        amount: f32,
        bipolar: bool,
    ) -> Result<(), EngineError> {
        self.check(address, slot)?;
        if !source.is_valid() {
            return Err(EngineError::UnknownSource(source));
        }

        let slots = self.routes.entry(address).or_default();
        slots[slot] = Some(ModulationRoute {
            source,
            amount: amount.clamp(-100.0, 100.0),
            bipolar,
        });

        debug!(%address, slot, %source, amount, bipolar, "route added");
        self.recompute_active_sources();
        Ok(())
    }

    /// Clear one slot. Returns true when the parameter has no routes left.
    pub fn remove_route(
        &mut self,
        address: ParameterAddress,
        slot: usize,
    ) -> Result<bool, EngineError> {
        self.check(address, slot)?;

        let Some(slots) = self.routes.get_mut(&address) else {
            return Ok(false);
        };
        if slots[slot].take().is_none() {
            return Ok(false);
        }

        let emptied = slots.iter().all(Option::is_none);
        if emptied {
            self.routes.remove(&address);
        }

        debug!(%address, slot, emptied, "route removed");
        self.recompute_active_sources();
        Ok(emptied)
    }

    /// Change the depth of an existing route. Empty slots are left empty.
    pub fn update_route_amount(
        &mut self,
        address: ParameterAddress,
        slot: usize,
        amount: f32,
    ) -> Result<(), EngineError> {
        self.check(address, slot)?;

        match self
            .routes
            .get_mut(&address)
            .and_then(|slots| slots[slot].as_mut())
        {
            Some(route) => route.amount = amount.clamp(-100.0, 100.0),
            None => debug!(%address, slot, "no route to update"),
        }
        self.recompute_active_sources();
        Ok(())
    }

    pub fn routes(&self, address: ParameterAddress) -> impl Iterator<Item = &ModulationRoute> {
        self.routes.get(&address).into_iter().flatten().flatten()
    }

    pub fn has_routes(&self) -> bool {
        !self.routes.is_empty()
    }

    pub fn is_modulated(&self, address: ParameterAddress) -> bool {
        self.routes.contains_key(&address)
    }

    pub fn active_sources(&self) -> &BTreeSet<ModSource> {
        &self.active_sources
    }

    fn recompute_active_sources(&mut self) {
        self.active_sources = self
            .routes
            .values()
            .flatten()
            .flatten()
            .map(|route| route.source)
            .collect();

        let active = &self.active_sources;
        self.source_values.retain(|source, _| active.contains(source));
    }

    /// Read every routed source. Unrouted sources are never touched.
    pub fn refresh_source_values<R: SourceReader + ?Sized>(&mut self, reader: &mut R) {
        for &source in &self.active_sources {
            let value = reader.read_source(source).clamp(-1.0, 1.0);
            self.source_values.insert(source, value);
        }
    }

    pub fn set_source_value(&mut self, source: ModSource, value: f32) {
        self.source_values.insert(source, value.clamp(-1.0, 1.0));
    }

    /// Last value read for `source`; 0 if it was never read.
    pub fn source_value(&self, source: ModSource) -> f32 {
        self.source_values.get(&source).copied().unwrap_or(0.0)
    }

    pub fn get_modulated_value(&self, address: ParameterAddress, base: f32) -> f32 {
        let (Some(slots), Some(meta)) = (self.routes.get(&address), self.registry.get(&address))
        else {
            return base;
        };

        let offset: f32 = slots
            .iter()
            .flatten()
            .map(|route| {
                route_contribution(self.source_value(route.source), route.amount, route.bipolar)
            })
            .sum();

        apply_offset(base, offset, meta.min, meta.max, meta.curve)
    }
}
