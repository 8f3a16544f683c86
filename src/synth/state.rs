use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    dsp::{
        analysis::HarmonicAnalyzer,
        waveform::{
            combine_layers, synthesize_from_expression, synthesize_from_harmonics,
            ExpressionFailurePolicy, ExpressionVariables, WaveSampler,
        },
        Harmonic, WaveformBuffer,
    },
    error::EngineError,
    HARMONIC_COUNT, WAVEFORM_LEN,
};

/// A compiled expression plus the front end's verdict on it.
#[derive(Clone)]
pub struct ExpressionLayer {
    pub sampler: Arc<dyn WaveSampler>,
    /// False while the source text doesn't compile; the layer is skipped.
    pub valid: bool,
    pub variables: ExpressionVariables,
}

/// Everything that decides the sound of one cycle.
///
/// Data only flows out of here: `render` produces a buffer and the voice
/// layer consumes it. Nothing downstream writes back.
pub struct SynthesisState {
    harmonics: [Harmonic; HARMONIC_COUNT],
    harmonics_enabled: bool,
    expression: Option<ExpressionLayer>,
    analyzer: HarmonicAnalyzer,
    current: WaveformBuffer,
}

impl SynthesisState {
    /// A pure sine: fundamental at full amplitude, no expression.
    pub fn new() -> Self {
        let mut harmonics = [Harmonic::default(); HARMONIC_COUNT];
        harmonics[0] = Harmonic::new(1.0, 0.0);

        let current = combine_layers(&[synthesize_from_harmonics(&harmonics).samples()]);
        Self {
            harmonics,
            harmonics_enabled: true,
            expression: None,
            analyzer: HarmonicAnalyzer::new(),
            current,
        }
    }

    pub fn harmonics(&self) -> &[Harmonic; HARMONIC_COUNT] {
        &self.harmonics
    }

    /// Missing entries are silenced; extra entries are ignored.
    pub fn set_harmonics(&mut self, harmonics: &[Harmonic]) {
        if harmonics.len() > HARMONIC_COUNT {
            warn!(
                given = harmonics.len(),
                kept = HARMONIC_COUNT,
                "too many harmonics, extra entries ignored"
            );
        }
        self.harmonics = [Harmonic::default(); HARMONIC_COUNT];
        for (slot, h) in self.harmonics.iter_mut().zip(harmonics) {
            *slot = *h;
        }
    }

    pub fn harmonics_enabled(&self) -> bool {
        self.harmonics_enabled
    }

    pub fn set_harmonics_enabled(&mut self, enabled: bool) {
        self.harmonics_enabled = enabled;
    }

    pub fn expression(&self) -> Option<&ExpressionLayer> {
        self.expression.as_ref()
    }

    pub fn set_expression(&mut self, layer: Option<ExpressionLayer>) {
        self.expression = layer;
    }

    /// Most recently rendered cycle.
    pub fn current(&self) -> &WaveformBuffer {
        &self.current
    }

    /// Synthesize and normalize the cycle from every enabled layer.
    ///
    /// On failure the previous cycle stays current.
    pub fn render(
        &mut self,
        policy: ExpressionFailurePolicy,
    ) -> Result<WaveformBuffer, EngineError> {
        let harmonic = self
            .harmonics_enabled
            .then(|| synthesize_from_harmonics(&self.harmonics));

        let expression = match &self.expression {
            Some(layer) if layer.valid => Some(synthesize_from_expression(
                layer.sampler.as_ref(),
                &layer.variables,
                WAVEFORM_LEN,
                policy,
            )?),
            Some(_) => {
                debug!("expression layer invalid, skipped");
                None
            }
            None => None,
        };

        let mut layers: Vec<&[f32]> = Vec::with_capacity(2);
        if let Some(buffer) = &harmonic {
            layers.push(buffer.samples());
        }
        if let Some(samples) = &expression {
            layers.push(samples);
        }

        self.current = combine_layers(&layers);
        Ok(self.current.clone())
    }

    /// Re-derive the harmonic view from the current cycle, e.g. when the
    /// user switches from the expression editor to the harmonic sliders.
    pub fn sync_harmonics_from_current(&mut self) -> &[Harmonic; HARMONIC_COUNT] {
        let extracted = self
            .analyzer
            .extract_harmonics(self.current.samples(), HARMONIC_COUNT);
        self.set_harmonics(&extracted);
        &self.harmonics
    }
}

impl Default for SynthesisState {
    fn default() -> Self {
        Self::new()
    }
}
