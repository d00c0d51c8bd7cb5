use crate::analyze::loops::LoopForest;
use crate::error::Lc;
use crate::ir::Region;
use crate::ir::def::*;
use crate::vectorize::shape::{VectorShape, decode_shapes};
use rustc_hash::{FxHashMap, FxHashSet};

// Scalar-to-vector function mapping for one region invocation.
#[derive(Debug, Clone)]
pub struct VectorMapping {
    pub scalar_name: String,
    pub vector_name: String,
    pub width: usize,
    // Position of the mask argument in the vector signature, if any.
    pub mask_pos: Option<usize>,
    pub result_shape: VectorShape,
    pub arg_shapes: Vec<VectorShape>,
}

impl VectorMapping {
    pub fn new(scalar_name: impl Into<String>, width: usize) -> Self {
        debug_assert!(width.is_power_of_two());
        let scalar_name = scalar_name.into();
        let vector_name = format!("{}_v{}", scalar_name, width);
        Self {
            scalar_name,
            vector_name,
            width,
            mask_pos: None,
            result_shape: VectorShape::undef(),
            arg_shapes: Vec::new(),
        }
    }

    // Argument and result shapes from a driver-supplied shape string.
    pub fn with_shape_string(scalar_name: impl Into<String>, width: usize, s: &str) -> Lc<Self> {
        let (arg_shapes, result) = decode_shapes(s)?;
        let mut mapping = Self::new(scalar_name, width);
        mapping.arg_shapes = arg_shapes;
        if let Some(r) = result {
            mapping.result_shape = r;
        }
        Ok(mapping)
    }
}

// Vectorization state of one region: value shapes, block predicates and the
// divergence classification of loops, exits and join points.
#[derive(Debug, Clone)]
pub struct VecInfo {
    region: Region,
    mapping: VectorMapping,

    shapes: FxHashMap<ValueId, VectorShape>,
    // Shapes fixed by the caller; later updates are ignored.
    pinned: FxHashSet<ValueId>,

    // Materialized per-block execution masks.
    predicates: FxHashMap<BlockId, ValueId>,

    // Loops (keyed by header) whose trip count differs across lanes.
    divergent_loops: FxHashSet<BlockId>,
    // Exit blocks of divergent loops that only some lanes reach.
    divergent_loop_exits: FxHashSet<BlockId>,
    // Join points of disjoint paths from a varying branch.
    join_divergent_blocks: FxHashSet<BlockId>,
    // Blocks that will receive a non-uniform predicate.
    varying_predicate_blocks: FxHashSet<BlockId>,
}

impl VecInfo {
    pub fn new(region: Region, mapping: VectorMapping) -> Self {
        Self {
            region,
            mapping,
            shapes: FxHashMap::default(),
            pinned: FxHashSet::default(),
            predicates: FxHashMap::default(),
            divergent_loops: FxHashSet::default(),
            divergent_loop_exits: FxHashSet::default(),
            join_divergent_blocks: FxHashSet::default(),
            varying_predicate_blocks: FxHashSet::default(),
        }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn mapping(&self) -> &VectorMapping {
        &self.mapping
    }

    pub fn width(&self) -> usize {
        self.mapping.width
    }

    pub fn entry(&self) -> BlockId {
        self.region.entry
    }

    pub fn in_region(&self, block: BlockId) -> bool {
        self.region.contains(block)
    }

    pub fn in_region_value(&self, fn_ir: &FnIR, v: ValueId) -> bool {
        match fn_ir.values[v].def_block {
            Some(b) => self.region.contains(b),
            None => true, // globally available
        }
    }

    // Shapes. Pinned values keep their shape; void values carry none.
    pub fn set_shape(&mut self, fn_ir: &FnIR, v: ValueId, shape: VectorShape) {
        debug_assert!(
            self.in_region_value(fn_ir, v),
            "shape update for out-of-region value {}",
            fn_ir.value_name(v)
        );
        if fn_ir.is_void(v) || self.pinned.contains(&v) {
            return;
        }
        self.shapes.insert(v, shape);
    }

    pub fn get_shape(&self, v: ValueId) -> VectorShape {
        self.shapes.get(&v).copied().unwrap_or(VectorShape::Undef)
    }

    pub fn has_known_shape(&self, v: ValueId) -> bool {
        self.shapes.contains_key(&v)
    }

    pub fn drop_shape(&mut self, v: ValueId) {
        self.shapes.remove(&v);
    }

    pub fn pin(&mut self, v: ValueId) {
        self.pinned.insert(v);
    }

    pub fn is_pinned(&self, v: ValueId) -> bool {
        self.pinned.contains(&v)
    }

    pub fn pin_with_shape(&mut self, fn_ir: &FnIR, v: ValueId, shape: VectorShape) {
        self.set_shape(fn_ir, v, shape);
        self.pin(v);
    }

    // The shape of @v as observed from @observer. A value defined inside a
    // divergent loop the observer is outside of carries temporal divergence
    // and reads as varying.
    pub fn observed_shape(
        &self,
        fn_ir: &FnIR,
        forest: &LoopForest,
        observer: BlockId,
        v: ValueId,
    ) -> VectorShape {
        if self.is_temporal_divergent(fn_ir, forest, observer, v) {
            return VectorShape::varying();
        }
        self.get_shape(v)
    }

    pub fn is_temporal_divergent(
        &self,
        fn_ir: &FnIR,
        forest: &LoopForest,
        observer: BlockId,
        v: ValueId,
    ) -> bool {
        let def_block = match fn_ir.values[v].def_block {
            Some(b) => b,
            None => return false,
        };
        let mut cur = forest.loop_for(def_block);
        while let Some(id) = cur {
            let lp = forest.get(id);
            if !lp.contains(observer) && self.is_divergent_loop(lp.header) {
                return true;
            }
            cur = lp.parent;
        }
        false
    }

    // Block predicates.
    pub fn set_predicate(&mut self, block: BlockId, mask: ValueId) {
        debug_assert!(self.in_region(block));
        self.predicates.insert(block, mask);
    }

    pub fn get_predicate(&self, block: BlockId) -> Option<ValueId> {
        self.predicates.get(&block).copied()
    }

    pub fn drop_predicate(&mut self, block: BlockId) {
        self.predicates.remove(&block);
    }

    // Loop divergence, keyed by header.
    pub fn add_divergent_loop(&mut self, header: BlockId) -> bool {
        self.divergent_loops.insert(header)
    }

    pub fn remove_divergent_loop(&mut self, header: BlockId) {
        self.divergent_loops.remove(&header);
    }

    pub fn is_divergent_loop(&self, header: BlockId) -> bool {
        self.divergent_loops.contains(&header)
    }

    // Loop exit divergence. A kill exit is an exit that is not divergent:
    // when it is taken, it is taken by every live lane at once.
    pub fn add_divergent_loop_exit(&mut self, block: BlockId) -> bool {
        self.divergent_loop_exits.insert(block)
    }

    pub fn remove_divergent_loop_exit(&mut self, block: BlockId) {
        self.divergent_loop_exits.remove(&block);
    }

    pub fn is_divergent_loop_exit(&self, block: BlockId) -> bool {
        self.divergent_loop_exits.contains(&block)
    }

    pub fn is_kill_exit(&self, block: BlockId) -> bool {
        !self.is_divergent_loop_exit(block)
    }

    // Disjoint-path join divergence.
    pub fn add_join_divergent_block(&mut self, block: BlockId) -> bool {
        self.join_divergent_blocks.insert(block)
    }

    pub fn is_join_divergent(&self, block: BlockId) -> bool {
        self.join_divergent_blocks.contains(&block)
    }

    // Tentative predicate shapes.
    pub fn add_varying_predicate_block(&mut self, block: BlockId) -> bool {
        self.varying_predicate_blocks.insert(block)
    }

    pub fn remove_varying_predicate_block(&mut self, block: BlockId) {
        self.varying_predicate_blocks.remove(&block);
    }

    pub fn has_varying_predicate(&self, block: BlockId) -> bool {
        self.varying_predicate_blocks.contains(&block)
    }
}
