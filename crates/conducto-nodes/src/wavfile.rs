//! WAV file source.
//!
//! Loads the whole file into memory during `setup` (decode happens on a
//! control thread, never in the audio path) and plays it back block by block.
//! In looping mode the position wraps; otherwise the node emits silence after
//! the last frame and raises a single `end_of_stream` notification, which the
//! control surface uses to auto-remove `play_file` nodes.

use conducto_core::{
    BlockContext, NodeDescriptor, NodeError, NodeKind, ParamSpec, ParamValue, PortDescriptor,
    PortIo, PortType, Processor,
};

/// Descriptor for `builtin://wavfile`.
pub fn descriptor() -> NodeDescriptor {
    NodeDescriptor {
        uri: "builtin://wavfile".into(),
        kind: NodeKind::Source,
        ports: vec![
            PortDescriptor::output("out:left", PortType::AudioMono),
            PortDescriptor::output("out:right", PortType::AudioMono),
        ],
        params: vec![
            ParamSpec::bytes("path"),
            ParamSpec::float("loop", 0.0, 1.0, 0.0),
        ],
        latency: 0,
    }
}

/// In-memory WAV playback source.
pub struct WavFileSource {
    path: String,
    looping: bool,
    left: Vec<f32>,
    right: Vec<f32>,
    pos: usize,
    eos_notified: bool,
}

impl WavFileSource {
    /// New source for a path; the file is read in [`setup`](Processor::setup).
    pub fn new(path: impl Into<String>, looping: bool) -> Self {
        Self {
            path: path.into(),
            looping,
            left: Vec::new(),
            right: Vec::new(),
            pos: 0,
            eos_notified: false,
        }
    }

    /// Frames loaded from the file.
    pub fn len(&self) -> usize {
        self.left.len()
    }

    /// Whether no frames are loaded.
    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }
}

impl Processor for WavFileSource {
    fn setup(&mut self) -> Result<(), NodeError> {
        let mut reader = hound::WavReader::open(&self.path)
            .map_err(|e| NodeError::Setup(format!("{}: {e}", self.path)))?;
        let spec = reader.spec();
        if spec.channels == 0 || spec.channels > 2 {
            return Err(NodeError::Setup(format!(
                "{}: unsupported channel count {}",
                self.path, spec.channels
            )));
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| NodeError::Setup(format!("{}: {e}", self.path)))?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / f32::from(i16::MAX);
                reader
                    .samples::<i16>()
                    .map(|s| s.map(|v| f32::from(v) * scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| NodeError::Setup(format!("{}: {e}", self.path)))?
            }
        };

        if spec.channels == 1 {
            self.left = interleaved.clone();
            self.right = interleaved;
        } else {
            self.left = interleaved.iter().step_by(2).copied().collect();
            self.right = interleaved.iter().skip(1).step_by(2).copied().collect();
        }
        self.pos = 0;
        self.eos_notified = false;

        tracing::info!(
            path = self.path,
            frames = self.left.len(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            "wav file loaded"
        );
        Ok(())
    }

    fn process_block(
        &mut self,
        ctxt: &mut BlockContext,
        io: &mut PortIo<'_>,
    ) -> Result<(), NodeError> {
        let n = ctxt.block_size;
        let (left, right) = io.out_pair(0, 1);

        for i in 0..n {
            if self.pos >= self.left.len() {
                if self.looping && !self.left.is_empty() {
                    self.pos = 0;
                } else {
                    left[i..].fill(0.0);
                    right[i..].fill(0.0);
                    if !self.eos_notified {
                        self.eos_notified = true;
                        ctxt.notify("end_of_stream", "1");
                    }
                    return Ok(());
                }
            }
            left[i] = self.left[self.pos];
            right[i] = self.right[self.pos];
            self.pos += 1;
        }
        Ok(())
    }

    fn set_parameter(&mut self, name: &str, value: &ParamValue) -> Result<(), NodeError> {
        match name {
            "loop" => {
                let v = value
                    .as_float()
                    .ok_or_else(|| NodeError::TypeMismatch(name.to_owned()))?;
                self.looping = v >= 0.5;
                Ok(())
            }
            // The file is decoded in setup; a new path needs a new node.
            "path" => Err(NodeError::Setup("path is fixed at creation".into())),
            _ => Err(NodeError::UnknownParameter(name.to_owned())),
        }
    }

    fn cleanup(&mut self) {
        self.left = Vec::new();
        self.right = Vec::new();
        self.pos = 0;
    }
}
