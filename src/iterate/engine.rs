//! Execution of a loop node.
//!
//! A [`LoopExecutor`] owns one body and runs it once per iteration:
//!
//! 1. *first* mappers copy invariant inputs and back-edge initializers, once per call;
//! 2. *before* mappers slice inputs and write the iteration counter;
//! 3. the body runs, after its parameters are reconciled with the new layouts;
//! 4. *after* mappers and dynamic buffers capture outputs;
//! 5. *back* mappers feed results into parameters of the next iteration;
//! 6. the continuation condition decides whether to go on.
//!
//! Once the loop stops, *last* mappers and buffer transfers produce the outputs.
//! Mappers are prepared once and reused while input layouts and the iteration bound stay the same.

use std::sync::Arc;

use derive_more::Display;
use itertools::Itertools;

use super::{
    body::Body,
    buffer::DynamicBuffer,
    checker::{PortChecker, Source},
    error::{ConstructionError, LoopError, PortKind},
    mapper::{Bindings, Fallback, PortMapper, SlicePlan},
    port::LoopDescriptor,
};
use crate::loom::{
    device::Device,
    layout::Layout,
    memory::{Memory, MemoryDesc},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum LoopState {
    #[default]
    Uninitialized,
    PortsPrepared,
    Iterating,
    Finalizing,
    Done,
}

/// Tuning of dynamic output buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Chunks a dynamic buffer holds before it first grows, when the iteration count is unknown.
    pub initial_capacity: usize,
    /// Factor a dynamic buffer grows by when full.
    pub growth_factor: usize,
    /// Upper bound on chunks preallocated from a known iteration count.
    pub preallocation_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 4,
            growth_factor: 2,
            preallocation_limit: 4096,
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    pub fn growth_factor(mut self, growth_factor: usize) -> Self {
        self.growth_factor = growth_factor;
        self
    }

    pub fn preallocation_limit(mut self, preallocation_limit: usize) -> Self {
        self.preallocation_limit = preallocation_limit;
        self
    }

    pub fn validate(&self) -> Result<(), ConstructionError> {
        if self.initial_capacity == 0 {
            return Err(ConstructionError::Config("initial capacity must be positive"));
        }
        if self.growth_factor < 2 {
            return Err(ConstructionError::Config("growth factor must be at least 2"));
        }
        if self.preallocation_limit == 0 {
            return Err(ConstructionError::Config("preallocation limit must be positive"));
        }
        Ok(())
    }
}

/// What a preparation depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CallKey {
    layouts: Vec<Layout>,
    /// Iterations known before the loop starts; `None` if only the body can tell.
    bound: Option<usize>,
}

#[derive(Debug)]
struct PreparedPorts {
    key: CallKey,
    first: Vec<PortMapper>,
    before: Vec<PortMapper>,
    after: Vec<PortMapper>,
    back: Vec<PortMapper>,
    last: Vec<PortMapper>,
    buffers: Vec<DynamicBuffer>,
    /// Initial allocation of each output slot.
    outputs: Vec<MemoryDesc>,
}

pub struct LoopExecutor<D, B> {
    descriptor: Arc<LoopDescriptor>,
    body: B,
    device: D,
    config: ExecutorConfig,
    trip_count: PortChecker,
    initial_condition: PortChecker,
    continue_condition: PortChecker,
    state: LoopState,
    prepared: Option<PreparedPorts>,
    preparations: usize,
}

impl<D: Device, B: Body> LoopExecutor<D, B> {
    pub fn new(
        descriptor: Arc<LoopDescriptor>,
        body: B,
        device: D,
        config: ExecutorConfig,
    ) -> Result<Self, ConstructionError> {
        config.validate()?;
        descriptor.validate()?;

        let signature = descriptor.body();
        let checks = [
            (PortKind::Parameter, signature.parameters.len(), body.parameters().len()),
            (PortKind::Result, signature.results.len(), body.results().len()),
        ];
        if let Some((kind, expected, got)) = checks.into_iter().find(|(_, x, y)| x != y) {
            return Err(ConstructionError::BodyMismatch {
                kind,
                expected,
                got,
            });
        }

        let trip_count = match descriptor.trip_count() {
            Some(slot) => PortChecker::TripCount(Source::Input(slot)),
            None => PortChecker::Static(-1),
        };
        let initial_condition = match descriptor.execution_condition() {
            Some(slot) => PortChecker::Condition(Source::Input(slot)),
            None => PortChecker::Static(1),
        };
        let continue_condition = match descriptor.special_ports().condition {
            Some(index) => PortChecker::Condition(Source::Result(index)),
            None => PortChecker::Static(1),
        };

        Ok(Self {
            descriptor,
            body,
            device,
            config,
            trip_count,
            initial_condition,
            continue_condition,
            state: LoopState::Uninitialized,
            prepared: None,
            preparations: 0,
        })
    }

    #[inline]
    pub fn descriptor(&self) -> &LoopDescriptor {
        &self.descriptor
    }

    #[inline]
    pub fn body(&self) -> &B {
        &self.body
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn config(&self) -> ExecutorConfig {
        self.config
    }

    #[inline]
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Number of times ports were prepared from scratch.
    #[inline]
    pub fn preparations(&self) -> usize {
        self.preparations
    }

    /// Runs the loop over `inputs`, one per input slot, and returns one tensor per output slot.
    ///
    /// On error nothing is returned and the executor starts from scratch on the next call.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(inputs = inputs.len())))]
    pub async fn execute(&mut self, inputs: &[Memory]) -> Result<Vec<Memory>, LoopError> {
        let outputs = self.run(inputs).await;
        if let Err(err) = &outputs {
            log::debug!("loop aborted: {err}");
            self.prepared = None;
            self.state = LoopState::Uninitialized;
        }
        outputs
    }

    async fn run(&mut self, inputs: &[Memory]) -> Result<Vec<Memory>, LoopError> {
        let descriptor = self.descriptor.clone();
        if inputs.len() != descriptor.num_inputs() {
            return Err(LoopError::InputCount {
                expected: descriptor.num_inputs(),
                got: inputs.len(),
            });
        }

        let mut bindings = Bindings::new(inputs, vec![], vec![]);
        let trip_count = self.trip_count.status(&bindings)?;
        let running = self.initial_condition.status(&bindings)? != 0;
        // sliced inputs are checked even if the loop never runs
        let bound = match self.bound(inputs, trip_count)? {
            _ if !running => Some(0),
            bound => bound,
        };

        let layouts = inputs.iter().map(|x| x.layout().clone()).collect_vec();
        let key = CallKey { layouts, bound };
        let mut prepared = match self.prepared.take() {
            Some(prepared) if prepared.key == key => prepared,
            _ => {
                self.state = LoopState::Uninitialized;
                let prepared = self.prepare(inputs, key)?;
                self.preparations += 1;
                prepared
            }
        };
        self.state = LoopState::PortsPrepared;

        let signature = descriptor.body();
        bindings.params = signature
            .parameters
            .iter()
            .map(|port| MemoryDesc::new(port.shape.to_empty_layout(), port.r#type))
            .map(|desc| self.device.create(desc))
            .collect();
        bindings.outputs = prepared
            .outputs
            .iter()
            .map(|desc| self.device.create(desc.clone()))
            .collect();
        for mapper in &prepared.first {
            mapper.execute(&self.device, 0, &mut bindings)?;
        }

        self.state = LoopState::Iterating;
        let timer = instant::Instant::now();
        let mut iteration = 0;
        let mut running = running;
        while running && bound.is_none_or(|bound| iteration < bound) {
            for mapper in &prepared.before {
                mapper.execute(&self.device, iteration, &mut bindings)?;
            }
            self.reconcile(&bindings.params)?;

            log::trace!("iteration {iteration}");
            let results = self
                .body
                .execute(&bindings.params)
                .await
                .map_err(|source| LoopError::Execution { iteration, source })?;
            if results.len() != signature.results.len() {
                return Err(LoopError::ResultCount {
                    expected: signature.results.len(),
                    got: results.len(),
                });
            }
            bindings.results = results;

            for mapper in &prepared.after {
                mapper.execute(&self.device, iteration, &mut bindings)?;
            }
            for buffer in &mut prepared.buffers {
                buffer.execute(&self.device, &bindings.results[buffer.result()])?;
            }
            for mapper in &prepared.back {
                mapper.execute(&self.device, iteration, &mut bindings)?;
            }

            running = self.continue_condition.status(&bindings)? != 0;
            iteration += 1;
        }

        self.state = LoopState::Finalizing;
        for mapper in &prepared.last {
            mapper.execute(&self.device, iteration, &mut bindings)?;
        }
        for buffer in &mut prepared.buffers {
            bindings.outputs[buffer.output()] = buffer.transfer(&self.device)?;
            buffer.reset();
        }

        log::debug!(
            "loop finished after {iteration} iterations in {:?}",
            timer.elapsed()
        );
        self.prepared = Some(prepared);
        self.state = LoopState::Done;
        Ok(bindings.outputs)
    }

    /// Iterations known before the loop starts: the trip count, capped by every sliced input.
    fn bound(&self, inputs: &[Memory], trip_count: i64) -> Result<Option<usize>, LoopError> {
        let mut bound = usize::try_from(trip_count).ok();
        for map in self.descriptor.sliced_inputs() {
            let layout = inputs[map.from].layout();
            let axis = map.axis.unwrap_or_default();
            let dim = layout.dim(axis).ok_or_else(|| LoopError::InputAxis {
                slot: map.from,
                axis,
                layout: layout.clone(),
            })?;
            let iterations = map
                .iterations(dim)
                .ok_or(LoopError::Range { rule: *map, dim })?;
            bound = Some(bound.map_or(iterations, |bound| bound.min(iterations)));
        }
        Ok(bound)
    }

    fn prepare(&self, inputs: &[Memory], key: CallKey) -> Result<PreparedPorts, LoopError> {
        let descriptor = &self.descriptor;
        let signature = descriptor.body();
        let special = descriptor.special_ports();

        let mut first = vec![];
        let mut before = vec![];
        for map in descriptor.input_maps() {
            let (from, to) = (map.from, map.to);
            let Some(axis) = map.axis else {
                first.push(PortMapper::Invariant { from, to });
                continue;
            };
            let input = &inputs[from];
            let layout = input.layout();
            let plan = SlicePlan::new(layout, axis, map.part_size, input.data_type());
            let desc = MemoryDesc::new(layout.with_dim(axis, map.part_size), input.data_type());
            before.push(PortMapper::SlicedIn {
                from,
                to,
                map: *map,
                plan,
                desc,
            });
        }
        if let Some(to) = special.current_iteration {
            let port = &signature.parameters[to];
            let layout = port
                .shape
                .to_layout()
                .filter(|layout| layout.size() == 1)
                .unwrap_or_else(Layout::scalar);
            let desc = MemoryDesc::new(layout, port.r#type);
            before.push(PortMapper::Counter { to, desc });
        }

        let back = descriptor
            .back_edges()
            .iter()
            .map(|edge| PortMapper::BackEdge {
                from: edge.from,
                to: edge.to,
            })
            .collect_vec();

        let mut after = vec![];
        let mut last = vec![];
        let mut buffers = vec![];
        let mut outputs = vec![];
        for (map, desc) in descriptor.output_maps().iter().zip_eq(descriptor.output_descs()) {
            let (from, to) = (map.to, map.from);
            let result = &signature.results[from];
            let empty = MemoryDesc::new(desc.shape.to_empty_layout(), desc.r#type);

            let Some(axis) = map.axis else {
                let fallback = match descriptor.back_edge_from(from) {
                    Some(edge) => Fallback::Param(edge.to),
                    None => Fallback::Empty(MemoryDesc::new(
                        result.shape.to_empty_layout(),
                        result.r#type,
                    )),
                };
                last.push(PortMapper::LastValue { from, to, fallback });
                outputs.push(empty);
                continue;
            };

            // outputs of a known length are written in place
            let chunk = result.shape.to_layout().filter(|_| special.condition.is_none());
            match (chunk, key.bound) {
                (Some(chunk), Some(iterations)) => {
                    let layout = chunk.with_dim(axis, iterations * map.part_size);
                    let plan = SlicePlan::new(&layout, axis, map.part_size, result.r#type);
                    after.push(PortMapper::SlicedOut {
                        from,
                        to,
                        stride: map.stride,
                        iterations,
                        plan,
                        chunk: MemoryDesc::new(chunk, result.r#type),
                    });
                    outputs.push(MemoryDesc::new(layout, result.r#type));
                }
                _ => {
                    let capacity = key
                        .bound
                        .filter(|&bound| bound > 0)
                        .map_or(self.config.initial_capacity, |bound| {
                            bound.min(self.config.preallocation_limit)
                        });
                    let buffer =
                        DynamicBuffer::new(*map, empty.clone(), capacity, self.config.growth_factor);
                    buffers.push(buffer);
                    outputs.push(empty);
                }
            }
        }

        log::debug!(
            "prepared ports: {} first, {} before, {} after, {} back, {} last, {} buffers, bound {:?}",
            first.len(),
            before.len(),
            after.len(),
            back.len(),
            last.len(),
            buffers.len(),
            key.bound
        );
        Ok(PreparedPorts {
            key,
            first,
            before,
            after,
            back,
            last,
            buffers,
            outputs,
        })
    }

    /// Asks the body to reshape if any parameter no longer fits its declared shape.
    fn reconcile(&mut self, params: &[Memory]) -> Result<(), LoopError> {
        let declared = self.body.parameters();
        let mut mismatches = params
            .iter()
            .zip(declared)
            .enumerate()
            .filter(|(_, (param, port))| !port.shape.is_compatible(param.layout()));
        let Some((index, (param, port))) = mismatches.next() else {
            return Ok(());
        };
        let (expected, got) = (port.shape.clone(), param.layout().clone());

        let rank_changed = params
            .iter()
            .zip(declared)
            .enumerate()
            .find(|(_, (param, port))| {
                let rank = param.layout().rank();
                port.shape.rank().is_some_and(|x| x != rank)
            });
        if let Some((index, (param, port))) = rank_changed {
            return Err(LoopError::ShapeMismatch {
                kind: PortKind::Parameter,
                index,
                expected: port.shape.clone(),
                got: param.layout().clone(),
                source: None,
            });
        }

        log::warn!("body parameter {index} reshaped from {expected} to {got}");
        let layouts = params.iter().map(|x| x.layout().clone()).collect_vec();
        self.body
            .reshape(&layouts)
            .map_err(|source| LoopError::ShapeMismatch {
                kind: PortKind::Parameter,
                index,
                expected,
                got,
                source: Some(source),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, error::Error, rc::Rc, sync::Arc};

    use itertools::Itertools;

    use super::{ExecutorConfig, LoopExecutor, LoopState};
    use crate::{
        iterate::{
            body::{Body, BodyError},
            build::{LoopBuilder, LoopNode, ValueId},
            error::{ConstructionError, LoopError, PortKind},
            port::{BackEdge, BodySignature, LoopDescriptor, PortDesc, SliceRule, SpecialBodyPorts},
        },
        loom::{
            device::{Cpu, Device},
            layout::{Dim, Layout, PartialShape},
            memory::{CopyRegion, Memory, MemoryDesc, MemoryError, MemoryId},
            num::DataType,
            platform::BoxFuture,
        },
    };

    type Kernel = Box<dyn FnMut(&[Memory]) -> Result<Vec<Memory>, BodyError>>;

    struct TestBody {
        parameters: Vec<PortDesc>,
        results: Vec<PortDesc>,
        kernel: Kernel,
        fixed: bool,
        calls: usize,
        reshapes: usize,
    }

    impl TestBody {
        fn new(
            signature: &BodySignature,
            kernel: impl FnMut(&[Memory]) -> Result<Vec<Memory>, BodyError> + 'static,
        ) -> Self {
            Self {
                parameters: signature.parameters.clone(),
                results: signature.results.clone(),
                kernel: Box::new(kernel),
                fixed: false,
                calls: 0,
                reshapes: 0,
            }
        }
    }

    impl Body for TestBody {
        fn parameters(&self) -> &[PortDesc] {
            &self.parameters
        }

        fn results(&self) -> &[PortDesc] {
            &self.results
        }

        fn reshape(&mut self, layouts: &[Layout]) -> Result<(), BodyError> {
            if self.fixed {
                return Err(BodyError::Reshape("static body".into()));
            }
            for (port, layout) in self.parameters.iter_mut().zip_eq(layouts) {
                port.shape = PartialShape::from(layout.clone());
            }
            self.reshapes += 1;
            Ok(())
        }

        fn execute<'a>(
            &'a mut self,
            params: &'a [Memory],
        ) -> BoxFuture<'a, Result<Vec<Memory>, BodyError>> {
            self.calls += 1;
            let results = (self.kernel)(params);
            Box::pin(async move { results })
        }
    }

    /// Counts copies by source.
    #[derive(Debug, Default)]
    struct Recorder {
        sources: RefCell<Vec<uid::Id<MemoryId>>>,
    }

    impl Device for Recorder {
        fn create(&self, desc: MemoryDesc) -> Memory {
            Cpu.create(desc)
        }

        fn copy(&self, src: &Memory, dst: &Memory, region: CopyRegion) -> Result<(), MemoryError> {
            self.sources.borrow_mut().push(src.id());
            Cpu.copy(src, dst, region)
        }
    }

    fn fail(err: MemoryError) -> BodyError {
        BodyError::Execute(err.to_string())
    }

    fn floats(memory: &Memory) -> Result<Vec<f32>, BodyError> {
        memory.to_vec().map_err(fail)
    }

    fn vector(data: &[f32]) -> Result<Memory, BodyError> {
        Memory::create([data.len()], data).map_err(fail)
    }

    fn counter(params: &[Memory]) -> i64 {
        params[0].read_int().unwrap_or_default()
    }

    fn scalar(name: &str, r#type: DataType) -> PortDesc {
        PortDesc::new(name, PartialShape::from_shape([]), r#type)
    }

    fn static_ports() -> SpecialBodyPorts {
        SpecialBodyPorts {
            current_iteration: Some(0),
            condition: None,
        }
    }

    fn dynamic_ports() -> SpecialBodyPorts {
        SpecialBodyPorts {
            current_iteration: Some(0),
            condition: Some(0),
        }
    }

    /// `[iter, x[1]] -> [cond, y[1]]`
    fn elementwise() -> BodySignature {
        BodySignature {
            parameters: vec![
                scalar("iter", DataType::I64),
                PortDesc::new("x", PartialShape::from_shape([1]), DataType::F32),
            ],
            results: vec![
                scalar("cond", DataType::Bool),
                PortDesc::new("y", PartialShape::from_shape([1]), DataType::F32),
            ],
        }
    }

    /// `y = 2x + 1`, continuing forever.
    fn affine(params: &[Memory]) -> Result<Vec<Memory>, BodyError> {
        let x = floats(&params[1])?;
        let y = x.iter().map(|x| 2.0 * x + 1.0).collect_vec();
        Ok(vec![Memory::boolean(true), vector(&y)?])
    }

    fn sliced_loop(special: SpecialBodyPorts, rule: SliceRule) -> Result<LoopNode, ConstructionError> {
        let mut builder = LoopBuilder::new(Some(ValueId(0)), Some(ValueId(1)));
        builder
            .set_body(elementwise())?
            .set_special_body_ports(special)
            .set_sliced_input(ValueId(2), 1, rule)?;
        builder.get_concatenated_slices(1, SliceRule::along(0))?;
        builder.build()
    }

    #[tokio::test]
    async fn test_trip_count() -> Result<(), Box<dyn Error>> {
        let data = (0..5).map(|x| x as f32).collect_vec();
        let r#ref = data.iter().map(|x| 2.0 * x + 1.0).collect_vec();

        // without a continuation condition the output is written in place
        for special in [static_ports(), dynamic_ports()] {
            let node = sliced_loop(special, SliceRule::along(0))?;
            let body = TestBody::new(node.descriptor.body(), affine);
            let mut executor =
                LoopExecutor::new(node.descriptor, body, Cpu, ExecutorConfig::default())?;

            let inputs = [
                Memory::scalar(5i64),
                Memory::boolean(true),
                Memory::create([5], &data)?,
            ];
            let outputs = executor.execute(&inputs).await?;
            assert_eq!(outputs.len(), 1);
            assert_eq!(outputs[0].layout(), &Layout::from_shape([5]));
            assert_eq!(outputs[0].to_vec::<f32>()?, r#ref);
            assert_eq!(executor.body().calls, 5);
            assert_eq!(executor.state(), LoopState::Done);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_sliced_input_bounds_trip_count() -> Result<(), Box<dyn Error>> {
        let node = sliced_loop(static_ports(), SliceRule::along(0))?;
        let body = TestBody::new(node.descriptor.body(), affine);
        let mut executor = LoopExecutor::new(node.descriptor, body, Cpu, ExecutorConfig::default())?;

        let inputs = [
            Memory::scalar(-1i64),
            Memory::boolean(true),
            Memory::create([3], &[0.0f32, 1.0, 2.0])?,
        ];
        let outputs = executor.execute(&inputs).await?;
        assert_eq!(outputs[0].to_vec::<f32>()?, vec![1.0, 3.0, 5.0]);
        Ok(())
    }

    #[tokio::test]
    async fn test_condition_stops() -> Result<(), Box<dyn Error>> {
        let signature = BodySignature {
            parameters: vec![scalar("iter", DataType::I64)],
            results: vec![
                scalar("cond", DataType::Bool),
                PortDesc::new("y", PartialShape::from_shape([1]), DataType::F32),
            ],
        };
        let mut builder = LoopBuilder::new(Some(ValueId(0)), Some(ValueId(1)));
        builder
            .set_body(signature.clone())?
            .set_special_body_ports(dynamic_ports());
        builder.get_concatenated_slices(1, SliceRule::along(0))?;
        builder.get_iter_value(1, -1)?;
        let node = builder.build()?;

        // the condition for the next iteration is `iter + 1 < 3`
        let body = TestBody::new(&signature, |params| {
            let iter = counter(params);
            Ok(vec![Memory::boolean(iter + 1 < 3), vector(&[iter as f32])?])
        });
        let mut executor =
            LoopExecutor::new(node.descriptor.clone(), body, Cpu, ExecutorConfig::default())?;

        let inputs = [Memory::scalar(-1i64), Memory::boolean(true)];
        let outputs = executor.execute(&inputs).await?;
        assert_eq!(executor.body().calls, 3);
        // the outputs of the iteration reporting false are kept
        assert_eq!(outputs[0].to_vec::<f32>()?, vec![0.0, 1.0, 2.0]);
        assert_eq!(outputs[1].to_vec::<f32>()?, vec![2.0]);

        // `iter < 3` is first false in iteration 3, which still runs
        let body = TestBody::new(&signature, |params| {
            let iter = counter(params);
            Ok(vec![Memory::boolean(iter < 3), vector(&[iter as f32])?])
        });
        let mut executor = LoopExecutor::new(node.descriptor, body, Cpu, ExecutorConfig::default())?;
        let outputs = executor.execute(&inputs).await?;
        assert_eq!(executor.body().calls, 4);
        assert_eq!(outputs[0].to_vec::<f32>()?, vec![0.0, 1.0, 2.0, 3.0]);
        Ok(())
    }

    /// `[iter, h[1]] -> [cond, h_next, y[1]]` with `h` carried.
    fn recurrent(h: impl Into<PartialShape>, h_next: impl Into<PartialShape>) -> BodySignature {
        BodySignature {
            parameters: vec![
                scalar("iter", DataType::I64),
                PortDesc::new("h", h, DataType::F32),
            ],
            results: vec![
                scalar("cond", DataType::Bool),
                PortDesc::new("h_next", h_next, DataType::F32),
                PortDesc::new("y", PartialShape::from_shape([1]), DataType::F32),
            ],
        }
    }

    fn recurrent_loop(signature: BodySignature) -> Result<LoopNode, ConstructionError> {
        let mut builder = LoopBuilder::new(Some(ValueId(0)), Some(ValueId(1)));
        builder
            .set_body(signature)?
            .set_special_body_ports(dynamic_ports())
            .set_merged_input(1, ValueId(2), 1)?;
        builder.get_iter_value(1, -1)?;
        builder.get_concatenated_slices(2, SliceRule::along(0))?;
        builder.build()
    }

    #[tokio::test]
    async fn test_initial_condition_false() -> Result<(), Box<dyn Error>> {
        let signature = recurrent(PartialShape::from_shape([2]), PartialShape::from_shape([2]));
        let node = recurrent_loop(signature.clone())?;
        let body = TestBody::new(&signature, |_| Err(BodyError::Execute("unreachable".into())));
        let mut executor = LoopExecutor::new(node.descriptor, body, Cpu, ExecutorConfig::default())?;

        let inputs = [
            Memory::scalar(10i64),
            Memory::boolean(false),
            Memory::create([2], &[1.0f32, 2.0])?,
        ];
        let outputs = executor.execute(&inputs).await?;
        assert_eq!(executor.body().calls, 0);
        // the carried value passes through, accumulations are empty
        assert_eq!(outputs[0].to_vec::<f32>()?, vec![1.0, 2.0]);
        assert!(!outputs[0].shares_storage(&inputs[2]));
        assert_eq!(outputs[1].layout(), &Layout::from_shape([0]));
        Ok(())
    }

    #[tokio::test]
    async fn test_skipped_loop_checks_inputs() -> Result<(), Box<dyn Error>> {
        let mut signature = elementwise();
        signature.parameters[1].shape = PartialShape::Dynamic;
        let mut builder = LoopBuilder::new(Some(ValueId(0)), Some(ValueId(1)));
        builder
            .set_body(signature.clone())?
            .set_special_body_ports(static_ports())
            .set_sliced_input(ValueId(2), 1, SliceRule::along(1))?;
        builder.get_concatenated_slices(1, SliceRule::along(0))?;
        let node = builder.build()?;

        let body = TestBody::new(&signature, affine);
        let mut executor = LoopExecutor::new(node.descriptor, body, Cpu, ExecutorConfig::default())?;
        let data = Memory::create([4], &[0.0f32; 4])?;
        for condition in [true, false] {
            let inputs = [Memory::scalar(2i64), Memory::boolean(condition), data.clone()];
            assert!(matches!(
                executor.execute(&inputs).await,
                Err(LoopError::InputAxis {
                    slot: 2,
                    axis: 1,
                    ..
                })
            ));
        }
        assert_eq!(executor.body().calls, 0);
        assert_eq!(executor.state(), LoopState::Uninitialized);
        Ok(())
    }

    #[tokio::test]
    async fn test_invariant_copied_once() -> Result<(), Box<dyn Error>> {
        let mut builder = LoopBuilder::new(Some(ValueId(0)), None);
        builder
            .set_body(elementwise())?
            .set_special_body_ports(static_ports())
            .set_invariant_input(ValueId(2), 1)?;
        builder.get_concatenated_slices(1, SliceRule::along(0))?;
        let node = builder.build()?;
        assert_eq!(node.descriptor.execution_condition(), None);

        let body = TestBody::new(node.descriptor.body(), affine);
        let device = Recorder::default();
        let mut executor = LoopExecutor::new(node.descriptor, body, device, ExecutorConfig::default())?;

        let inputs = [Memory::scalar(4i64), Memory::create([1], &[3.0f32])?];
        let outputs = executor.execute(&inputs).await?;
        assert_eq!(outputs[0].to_vec::<f32>()?, vec![7.0; 4]);

        let sources = executor.device().sources.borrow();
        let copies = sources.iter().filter(|id| **id == inputs[1].id()).count();
        assert_eq!(copies, 1);
        Ok(())
    }

    /// Appends the current length of `h` to it.
    fn grow(params: &[Memory]) -> Result<Vec<Memory>, BodyError> {
        let mut h = floats(&params[1])?;
        h.push(h.len() as f32);
        let y = [h.len() as f32];
        Ok(vec![Memory::boolean(true), vector(&h)?, vector(&y)?])
    }

    #[tokio::test]
    async fn test_back_edge_growth() -> Result<(), Box<dyn Error>> {
        let signature = recurrent(PartialShape::from_shape([1]), [Dim::Unknown]);
        let node = recurrent_loop(signature.clone())?;
        assert_eq!(
            node.descriptor.output_descs()[0].shape,
            PartialShape::from([Dim::Unknown])
        );

        let body = TestBody::new(&signature, grow);
        let mut executor = LoopExecutor::new(node.descriptor, body, Cpu, ExecutorConfig::default())?;
        let inputs = [
            Memory::scalar(3i64),
            Memory::boolean(true),
            Memory::create([1], &[1.0f32])?,
        ];
        let outputs = executor.execute(&inputs).await?;
        assert_eq!(outputs[0].to_vec::<f32>()?, vec![1.0, 1.0, 2.0, 3.0]);
        assert_eq!(outputs[1].to_vec::<f32>()?, vec![2.0, 3.0, 4.0]);
        // the parameter grew before iterations 1 and 2
        assert_eq!(executor.body().reshapes, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_shape_mismatch() -> Result<(), Box<dyn Error>> {
        let signature = recurrent(PartialShape::from_shape([1]), PartialShape::Dynamic);
        let inputs = [
            Memory::scalar(3i64),
            Memory::boolean(true),
            Memory::create([1], &[1.0f32])?,
        ];

        // `h` turns into a matrix after the first iteration
        let node = recurrent_loop(signature.clone())?;
        let body = TestBody::new(&signature, |params| {
            let h = floats(&params[1])?;
            let h = Memory::create([1, h.len()], &h).map_err(fail)?;
            Ok(vec![Memory::boolean(true), h, vector(&[0.0])?])
        });
        let mut executor = LoopExecutor::new(node.descriptor, body, Cpu, ExecutorConfig::default())?;
        assert!(matches!(
            executor.execute(&inputs).await,
            Err(LoopError::ShapeMismatch {
                kind: PortKind::Parameter,
                index: 1,
                source: None,
                ..
            })
        ));
        assert_eq!(executor.state(), LoopState::Uninitialized);
        assert_eq!(executor.body().calls, 1);

        // same rank, but the body refuses to reshape
        let node = recurrent_loop(signature.clone())?;
        let mut body = TestBody::new(&signature, grow);
        body.fixed = true;
        let mut executor = LoopExecutor::new(node.descriptor, body, Cpu, ExecutorConfig::default())?;
        assert!(matches!(
            executor.execute(&inputs).await,
            Err(LoopError::ShapeMismatch {
                index: 1,
                source: Some(BodyError::Reshape(_)),
                ..
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_reverse_stride() -> Result<(), Box<dyn Error>> {
        let mut builder = LoopBuilder::new(None, None);
        builder
            .set_body(elementwise())?
            .set_special_body_ports(static_ports())
            .set_sliced_input(ValueId(0), 1, SliceRule::reversed(0))?;
        builder.get_concatenated_slices(1, SliceRule::along(0))?;
        builder.get_concatenated_slices(1, SliceRule::reversed(0))?;
        let node = builder.build()?;

        let body = TestBody::new(node.descriptor.body(), |params| {
            Ok(vec![Memory::boolean(true), params[1].clone()])
        });
        let mut executor = LoopExecutor::new(node.descriptor, body, Cpu, ExecutorConfig::default())?;
        let inputs = [Memory::create([4], &[0.0f32, 1.0, 2.0, 3.0])?];
        let outputs = executor.execute(&inputs).await?;
        assert_eq!(outputs[0].to_vec::<f32>()?, vec![3.0, 2.0, 1.0, 0.0]);
        // a reversed output undoes the reversed input
        assert_eq!(outputs[1].to_vec::<f32>()?, vec![0.0, 1.0, 2.0, 3.0]);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_scalars() -> Result<(), Box<dyn Error>> {
        let node = sliced_loop(dynamic_ports(), SliceRule::along(0))?;
        let data = Memory::create([2], &[0.0f32, 1.0])?;

        let body = TestBody::new(node.descriptor.body(), affine);
        let mut executor = LoopExecutor::new(node.descriptor.clone(), body, Cpu, ExecutorConfig::default())?;
        let inputs = [Memory::scalar(-2i64), Memory::boolean(true), data.clone()];
        assert!(matches!(
            executor.execute(&inputs).await,
            Err(LoopError::TripCount(-2))
        ));
        let inputs = [Memory::scalar(2i64), Memory::scalar(2u8), data.clone()];
        assert!(matches!(
            executor.execute(&inputs).await,
            Err(LoopError::Condition(2))
        ));
        assert!(matches!(
            executor.execute(&inputs[..2]).await,
            Err(LoopError::InputCount { expected: 3, got: 2 })
        ));

        // a condition of 2 coming out of the body
        let body = TestBody::new(node.descriptor.body(), |params| {
            let y = floats(&params[1])?;
            Ok(vec![Memory::scalar(2u8), vector(&y)?])
        });
        let mut executor = LoopExecutor::new(node.descriptor, body, Cpu, ExecutorConfig::default())?;
        let inputs = [Memory::scalar(2i64), Memory::boolean(true), data];
        assert!(matches!(
            executor.execute(&inputs).await,
            Err(LoopError::Condition(2))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_body_failure() -> Result<(), Box<dyn Error>> {
        let node = sliced_loop(dynamic_ports(), SliceRule::along(0))?;
        let failing = Rc::new(RefCell::new(true));
        let body = TestBody::new(node.descriptor.body(), {
            let failing = failing.clone();
            move |params| match *failing.borrow() && counter(params) == 2 {
                true => Err(BodyError::Execute("out of memory".into())),
                false => affine(params),
            }
        });
        let mut executor = LoopExecutor::new(node.descriptor, body, Cpu, ExecutorConfig::default())?;

        let data = (0..5).map(|x| x as f32).collect_vec();
        let inputs = [
            Memory::scalar(5i64),
            Memory::boolean(true),
            Memory::create([5], &data)?,
        ];
        assert!(matches!(
            executor.execute(&inputs).await,
            Err(LoopError::Execution { iteration: 2, .. })
        ));
        assert_eq!(executor.state(), LoopState::Uninitialized);

        // the next call starts clean
        *failing.borrow_mut() = false;
        let outputs = executor.execute(&inputs).await?;
        assert_eq!(outputs[0].to_vec::<f32>()?, vec![1.0, 3.0, 5.0, 7.0, 9.0]);
        assert_eq!(executor.state(), LoopState::Done);
        Ok(())
    }

    #[tokio::test]
    async fn test_preparation_cache() -> Result<(), Box<dyn Error>> {
        let mut builder = LoopBuilder::new(Some(ValueId(0)), None);
        builder
            .set_body(elementwise())?
            .set_special_body_ports(static_ports())
            .set_invariant_input(ValueId(1), 1)?;
        builder.get_concatenated_slices(1, SliceRule::along(0))?;
        let node = builder.build()?;

        let body = TestBody::new(node.descriptor.body(), affine);
        let mut executor = LoopExecutor::new(node.descriptor, body, Cpu, ExecutorConfig::default())?;
        let x = Memory::create([1], &[1.0f32])?;

        let first = executor.execute(&[Memory::scalar(2i64), x.clone()]).await?;
        let second = executor.execute(&[Memory::scalar(2i64), x.clone()]).await?;
        assert_eq!(executor.preparations(), 1);
        // every call hands out fresh outputs
        assert!(!first[0].shares_storage(&second[0]));
        assert_eq!(first[0].to_vec::<f32>()?, second[0].to_vec::<f32>()?);

        // a new trip count changes the preallocated output
        let outputs = executor.execute(&[Memory::scalar(3i64), x.clone()]).await?;
        assert_eq!(executor.preparations(), 2);
        assert_eq!(outputs[0].layout(), &Layout::from_shape([3]));

        // so does a new input layout; the body reshapes, but its wider result no longer fits
        let wide = Memory::create([2], &[1.0f32, 2.0])?;
        let outputs = executor.execute(&[Memory::scalar(3i64), wide]).await;
        assert_eq!(executor.preparations(), 3);
        assert!(outputs.is_err());
        assert_eq!(executor.body().reshapes, 1);
        Ok(())
    }

    #[test]
    fn test_reject_executor() -> Result<(), Box<dyn Error>> {
        let node = sliced_loop(dynamic_ports(), SliceRule::along(0))?;
        let mut signature = elementwise();
        signature.parameters.pop();
        let body = TestBody::new(&signature, affine);
        assert!(matches!(
            LoopExecutor::new(node.descriptor.clone(), body, Cpu, ExecutorConfig::default()),
            Err(ConstructionError::BodyMismatch {
                kind: PortKind::Parameter,
                expected: 2,
                got: 1
            })
        ));

        let body = TestBody::new(&elementwise(), affine);
        let config = ExecutorConfig::new().growth_factor(1);
        assert!(matches!(
            LoopExecutor::new(node.descriptor, body, Cpu, config),
            Err(ConstructionError::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_reject_descriptor() -> Result<(), Box<dyn Error>> {
        let node = sliced_loop(dynamic_ports(), SliceRule::along(0))?;
        let check = |edit: fn(&mut LoopDescriptor)| {
            let mut descriptor = (*node.descriptor).clone();
            edit(&mut descriptor);
            let body = TestBody::new(descriptor.body(), affine);
            LoopExecutor::new(Arc::new(descriptor), body, Cpu, ExecutorConfig::default()).err()
        };

        assert!(check(|_| {}).is_none());
        assert!(matches!(
            check(|x| x.inputs[0].from = 7),
            Some(ConstructionError::InputIndex { index: 7, count: 3 })
        ));
        assert!(matches!(
            check(|x| x.trip_count = Some(5)),
            Some(ConstructionError::InputIndex { index: 5, count: 3 })
        ));
        assert!(matches!(
            check(|x| x.inputs[0].to = 2),
            Some(ConstructionError::PortIndex {
                kind: PortKind::Parameter,
                index: 2,
                count: 2
            })
        ));
        assert!(matches!(
            check(|x| x.special.condition = Some(4)),
            Some(ConstructionError::PortIndex {
                kind: PortKind::Result,
                index: 4,
                ..
            })
        ));
        assert!(matches!(
            check(|x| x.outputs[0].from = 3),
            Some(ConstructionError::OutputIndex { index: 3, count: 1 })
        ));
        assert!(matches!(
            check(|x| x.output_descs.clear()),
            Some(ConstructionError::OutputCount { maps: 1, descs: 0 })
        ));
        assert!(matches!(
            check(|x| x.back_edges.push(BackEdge { from: 1, to: 9 })),
            Some(ConstructionError::PortIndex {
                kind: PortKind::Parameter,
                index: 9,
                ..
            })
        ));
        Ok(())
    }
}
