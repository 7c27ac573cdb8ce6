//! `weft` runs per-element operations over a tiled, multi-dimensional iteration space.
//!
//! ## Key Components
//! 1. **Iteration Space**:
//!    - Bounded, strided segments (`Segment`) composed into an `IterationSpace`.
//!    - Tile descriptors split one dimension into outer tiles and inner offsets.
//!
//! 2. **Statement Tree**:
//!    - Declarative traversal (`Statement`): loops, tiles, collapsed loops, staging of local
//!      tiles, body invocations, barriers and GPU kernel entries.
//!    - Bodies (`Body`) declare a signature; bindings are checked against it before anything runs.
//!
//! 3. **Local Memory**:
//!    - Tile buffers (`LocalTile`) declared by element type, shape and axis permutation.
//!    - Per-traversal stack storage or block-shared storage on the GPU backend.
//!
//! 4. **Execution**:
//!    - One tree, three backends: sequential, host-parallel (`rayon`) and a GPU thread-block
//!      model with real block-wide barriers.
//!
//! ```
//! use weft::{
//!     Arg, Body, EngineBuilder, IterationSpace, KernelBuilder, Policy, Statement, View, segs,
//! };
//!
//! let engine = EngineBuilder::new().build()?;
//! let output = View::<u64>::new([4, 3]);
//! let body = {
//!     let output = output.clone();
//!     Body::new([Arg::Index, Arg::Index], move |args| {
//!         let (row, col) = (args.index(0), args.index(1));
//!         output.set([row, col], (row * col) as u64);
//!     })
//! };
//! let tree = [Statement::tile(
//!     0,
//!     2,
//!     Policy::Seq,
//!     Policy::Seq,
//!     [Statement::inner(
//!         0,
//!         [Statement::for_each(1, Policy::Seq, [Statement::invoke(0, segs([0, 1]))])],
//!     )],
//! )];
//! KernelBuilder::new(IterationSpace::from((0..4, 0..3)))
//!     .body(body)
//!     .tree(tree)
//!     .build(&engine)?
//!     .execute();
//! assert_eq!(output.get([3, 2]), 6);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod body;
pub mod engine;
pub mod layout;
pub mod num;
pub mod param;
pub mod space;
pub mod statement;
pub mod tile;
pub mod view;

pub use body::{Arg, Args, Body};
pub use engine::{
    Backend, Engine, EngineBuilder, Kernel, KernelBuilder, KernelError, LaunchConfig, Limits,
    execute,
};
pub use layout::{Layout, LayoutError};
pub use num::{DataType, Scalar};
pub use param::{Param, Params};
pub use space::{IterationSpace, Segment, SpaceError, TileDescriptor};
pub use statement::{Axis, Binding, Guard, Policy, Statement, offsets, params, segs};
pub use tile::{LocalTile, Storage, TileDecl, TileRef};
pub use view::{View, ViewError};
