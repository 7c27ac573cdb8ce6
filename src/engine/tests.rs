use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use itertools::iproduct;

use super::{Backend, Engine, EngineBuilder, KernelBuilder, KernelError, Limits, execute};
use crate::{
    body::{Arg, Body},
    num::DataType,
    param::Param,
    space::{IterationSpace, Segment, SpaceError},
    statement::{Axis, Binding, Policy, Statement, offsets, params, segs},
    tile::{Storage, TileDecl},
    view::View,
};

const TILE: usize = 16;
const BACKENDS: [Backend; 3] = [Backend::Sequential, Backend::HostParallel, Backend::Gpu];

macro_rules! assert_approx_eq {
    ($i:expr, $a:expr, $b:expr, $eps:expr) => {
        assert!(
            ($a - $b).abs() < $eps,
            "assertion failed at {:?}: `(left ~= right)`\n  left: `{}`\n right: `{}`",
            $i,
            $a,
            $b
        );
    };
}

fn engine(backend: Backend) -> Result<Engine, KernelError> {
    EngineBuilder::new()
        .backend(backend)
        .threads(4)
        .resident_blocks(2)
        .build()
}

/// Loads `A` through the staged tiles of `slots` and writes them back transposed.
///
/// The space is `(col, row)`; the host variant of `collapse` distributes each phase over
/// the tile's points instead of the outer tiles.
fn transpose_tree(backend: Backend, slots: &[usize], collapse: bool) -> Vec<Statement> {
    let bindings = [segs([0, 1]), offsets([0, 1]), params(slots.iter().copied())].concat();
    let load = Statement::invoke(0, bindings.clone());
    let store = Statement::invoke(1, bindings);

    match backend {
        Backend::Gpu => vec![Statement::kernel([Statement::tile(
            1,
            TILE,
            Policy::Block(Axis::Y),
            Policy::Thread(Axis::Y),
            [Statement::tile(
                0,
                TILE,
                Policy::Block(Axis::X),
                Policy::Thread(Axis::X),
                [Statement::stage(
                    slots.to_vec(),
                    Storage::Shared,
                    [
                        Statement::inner(1, [Statement::inner(0, [load])]),
                        Statement::Sync,
                        // swap the thread mapping so every thread reads another thread's element
                        Statement::for_each(
                            0,
                            Policy::Thread(Axis::Y),
                            [Statement::for_each(1, Policy::Thread(Axis::X), [store])],
                        ),
                    ],
                )],
            )],
        )])],
        _ if collapse => vec![Statement::tile(
            1,
            TILE,
            Policy::Seq,
            Policy::Seq,
            [Statement::tile(
                0,
                TILE,
                Policy::Seq,
                Policy::Seq,
                [Statement::stage(
                    slots.to_vec(),
                    Storage::Stack,
                    [
                        Statement::collapse([0, 1], Policy::Parallel, [load]),
                        Statement::collapse([0, 1], Policy::Parallel, [store]),
                    ],
                )],
            )],
        )],
        _ => vec![Statement::tile(
            1,
            TILE,
            Policy::Parallel,
            Policy::Seq,
            [Statement::tile(
                0,
                TILE,
                Policy::Seq,
                Policy::Seq,
                [Statement::stage(
                    slots.to_vec(),
                    Storage::Stack,
                    [
                        Statement::inner(1, [Statement::inner(0, [load])]),
                        Statement::Sync,
                        Statement::inner(0, [Statement::inner(1, [store])]),
                    ],
                )],
            )],
        )],
    }
}

fn transpose(backend: Backend, rows: usize, cols: usize) -> Result<(), Box<dyn Error>> {
    let a = View::<f64>::new([rows, cols]);
    for (row, col) in iproduct!(0..rows, 0..cols) {
        a.set([row, col], col as f64);
    }
    let at = View::<f64>::new([cols, rows]);

    let signature = [
        Arg::Index,
        Arg::Index,
        Arg::Offset,
        Arg::Offset,
        Arg::Tile(DataType::F64),
    ];
    let load = {
        let a = a.clone();
        Body::new(signature, move |args| {
            let (col, row) = (args.index(0), args.index(1));
            let (tx, ty) = (args.offset(2), args.offset(3));
            args.tile::<f64>(4).set([ty, tx], a.get([row, col]));
        })
    };
    let store = {
        let at = at.clone();
        Body::new(signature, move |args| {
            let (col, row) = (args.index(0), args.index(1));
            let (tx, ty) = (args.offset(2), args.offset(3));
            at.set([col, row], args.tile::<f64>(4).get([ty, tx]));
        })
    };

    let engine = engine(backend)?;
    execute(
        &engine,
        (0..cols, 0..rows),
        transpose_tree(backend, &[0], false),
        [Param::tile(TileDecl::new::<f64>([TILE, TILE])?)],
        [load, store],
    )?;

    for (col, row) in iproduct!(0..cols, 0..rows) {
        assert_eq!(at.get([col, row]), col as f64, "{backend} at ({col}, {row})");
    }
    Ok(())
}

#[test]
fn test_transpose() -> Result<(), Box<dyn Error>> {
    for backend in BACKENDS {
        transpose(backend, 267, 251)?;
    }
    Ok(())
}

#[test]
fn test_transpose_shapes() -> Result<(), Box<dyn Error>> {
    // exact multiples, a single partial tile, and extents smaller than one tile
    for (backend, (rows, cols)) in iproduct!(BACKENDS, [(32, 48), (17, 33), (5, 3), (1, 20)]) {
        transpose(backend, rows, cols)?;
    }
    Ok(())
}

#[test]
fn test_transpose_two_tiles() -> Result<(), Box<dyn Error>> {
    let (rows, cols) = (144, 255);
    for (backend, collapse) in [
        (Backend::Sequential, false),
        (Backend::HostParallel, true),
        (Backend::Gpu, false),
    ] {
        let a = View::<f64>::new([rows, cols]);
        let b = View::<f64>::new([rows, cols]);
        for (row, col) in iproduct!(0..rows, 0..cols) {
            a.set([row, col], col as f64);
            b.set([row, col], (row * cols + col) as f64);
        }
        let at = View::<f64>::new([cols, rows]);
        let bt = View::<f64>::permuted([cols, rows], [1, 0])?;

        let signature = [
            Arg::Index,
            Arg::Index,
            Arg::Offset,
            Arg::Offset,
            Arg::Tile(DataType::F64),
            Arg::Tile(DataType::F64),
        ];
        let load = {
            let (a, b) = (a.clone(), b.clone());
            Body::new(signature, move |args| {
                let (col, row) = (args.index(0), args.index(1));
                let (tx, ty) = (args.offset(2), args.offset(3));
                args.tile::<f64>(4).set([ty, tx], a.get([row, col]));
                args.tile::<f64>(5).set([ty, tx], b.get([row, col]));
            })
        };
        let store = {
            let (at, bt) = (at.clone(), bt.clone());
            Body::new(signature, move |args| {
                let (col, row) = (args.index(0), args.index(1));
                let (tx, ty) = (args.offset(2), args.offset(3));
                at.set([col, row], args.tile::<f64>(4).get([ty, tx]));
                bt.set([col, row], args.tile::<f64>(5).get([ty, tx]));
            })
        };

        let engine = engine(backend)?;
        KernelBuilder::new((0..cols, 0..rows))
            .param(TileDecl::new::<f64>([TILE, TILE])?)
            .param(TileDecl::permuted::<f64>([TILE, TILE], [1, 0])?)
            .body(load)
            .body(store)
            .tree(transpose_tree(backend, &[0, 1], collapse))
            .build(&engine)?
            .execute();

        for (row, col) in iproduct!(0..rows, 0..cols) {
            assert_eq!(at.get([col, row]), col as f64, "{backend} at ({col}, {row})");
            assert_eq!(
                bt.get([col, row]),
                (row * cols + col) as f64,
                "{backend} at ({col}, {row})"
            );
        }
    }
    Ok(())
}

/// Sliding-window matrix product over `(tx, ty, window, bx, by)`.
fn matmul_tree(backend: Backend) -> Vec<Statement> {
    let (outer, y, x, storage) = match backend {
        Backend::Gpu => (
            [Policy::Block(Axis::Y), Policy::Block(Axis::X)],
            Policy::Thread(Axis::Y),
            Policy::Thread(Axis::X),
            Storage::Shared,
        ),
        _ => (
            [Policy::Parallel, Policy::Seq],
            Policy::Seq,
            Policy::Seq,
            Storage::Stack,
        ),
    };
    let threads = |body: Statement| {
        Statement::for_each(1, y, [Statement::for_each(0, x, [body])])
    };
    let all = [segs([0, 1, 2, 3, 4]), params([0, 1, 2])].concat();

    let body = Statement::for_each(
        4,
        outer[0],
        [Statement::for_each(
            3,
            outer[1],
            [Statement::stage(
                [0, 1, 2],
                storage,
                [
                    threads(Statement::invoke(0, [Binding::Index(0), Binding::Index(1), Binding::Param(2)])),
                    Statement::for_each(
                        2,
                        Policy::Seq,
                        [
                            threads(Statement::invoke(1, all.clone())),
                            Statement::Sync,
                            threads(Statement::invoke(2, all.clone())),
                            Statement::Sync,
                        ],
                    ),
                    threads(Statement::invoke(3, all)),
                ],
            )],
        )],
    );
    match backend {
        Backend::Gpu => vec![Statement::kernel([body])],
        _ => vec![body],
    }
}

fn matmul(backend: Backend, n: usize, m: usize, p: usize) -> Result<(), Box<dyn Error>> {
    fastrand::seed(42);
    let a = View::<f64>::new([n, m]);
    let b = View::<f64>::new([m, p]);
    for (row, col) in iproduct!(0..n, 0..m) {
        a.set([row, col], fastrand::f64() - 0.5);
    }
    for (row, col) in iproduct!(0..m, 0..p) {
        b.set([row, col], fastrand::f64() - 0.5);
    }
    let c = View::<f64>::new([n, p]);

    let tile = Arg::Tile(DataType::F64);
    let full = [
        Arg::Index,
        Arg::Index,
        Arg::Index,
        Arg::Index,
        Arg::Index,
        tile,
        tile,
        tile,
    ];
    let init = Body::new([Arg::Index, Arg::Index, tile], |args| {
        let (tx, ty) = (args.index(0), args.index(1));
        args.tile::<f64>(2).set([ty, tx], 0.0);
    });
    let load = {
        let (a, b) = (a.clone(), b.clone());
        Body::new(full, move |args| {
            let (tx, ty, window, bx, by) = (
                args.index(0),
                args.index(1),
                args.index(2),
                args.index(3),
                args.index(4),
            );
            let (row, col) = (by * TILE + ty, bx * TILE + tx);
            let (a_col, b_row) = (window * TILE + tx, window * TILE + ty);
            let a_value = if row < n && a_col < m {
                a.get([row, a_col])
            } else {
                0.0
            };
            let b_value = if b_row < m && col < p {
                b.get([b_row, col])
            } else {
                0.0
            };
            args.tile::<f64>(5).set([ty, tx], a_value);
            args.tile::<f64>(6).set([ty, tx], b_value);
        })
    };
    let accumulate = Body::new(full, |args| {
        let (tx, ty) = (args.index(0), args.index(1));
        let (a, b) = (args.tile::<f64>(5), args.tile::<f64>(6));
        let dot: f64 = (0..TILE).map(|j| a.get([ty, j]) * b.get([j, tx])).sum();
        args.tile::<f64>(7).update([ty, tx], |x| x + dot);
    });
    let store = {
        let c = c.clone();
        Body::new(full, move |args| {
            let (tx, ty, bx, by) = (args.index(0), args.index(1), args.index(3), args.index(4));
            let (row, col) = (by * TILE + ty, bx * TILE + tx);
            if row < n && col < p {
                c.set([row, col], args.tile::<f64>(7).get([ty, tx]));
            }
        })
    };

    let engine = engine(backend)?;
    let space = IterationSpace::from((
        0..TILE,
        0..TILE,
        0..m.div_ceil(TILE),
        0..p.div_ceil(TILE),
        0..n.div_ceil(TILE),
    ));
    let kernel = KernelBuilder::new(space)
        .params([
            Param::tile(TileDecl::new::<f64>([TILE, TILE])?),
            Param::tile(TileDecl::new::<f64>([TILE, TILE])?),
            Param::tile(TileDecl::new::<f64>([TILE, TILE])?),
        ])
        .bodies([init, load, accumulate, store])
        .tree(matmul_tree(backend))
        .build(&engine)?;
    if backend == Backend::Gpu {
        let launches = kernel.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].grid, [p.div_ceil(TILE), n.div_ceil(TILE), 1]);
        assert_eq!(launches[0].block, [TILE, TILE, 1]);
    }
    kernel.execute();

    for (row, col) in iproduct!(0..n, 0..p) {
        let expected: f64 = (0..m).map(|k| a.get([row, k]) * b.get([k, col])).sum();
        assert_approx_eq!((backend, row, col), c.get([row, col]), expected, 1e-9);
    }
    Ok(())
}

#[test]
fn test_matmul() -> Result<(), Box<dyn Error>> {
    for backend in BACKENDS {
        matmul(backend, 150, 25, 95)?;
    }
    Ok(())
}

/// `C = A * B` with `A[r][c] = r`, `B[r][c] = c` over `(col, row, k)`, accumulating into a
/// scalar parameter.
fn mult3(backend: Backend, n: usize) -> Result<(), Box<dyn Error>> {
    let a = View::<f64>::new([n, n]);
    let b = View::<f64>::new([n, n]);
    for (row, col) in iproduct!(0..n, 0..n) {
        a.set([row, col], row as f64);
        b.set([row, col], col as f64);
    }
    let c = View::<f64>::new([n, n]);

    let scalar = Arg::Scalar(DataType::F64);
    let init = Body::new([scalar], |args| args.set_scalar(0, 0.0f64));
    let accumulate = {
        let (a, b) = (a.clone(), b.clone());
        Body::new([Arg::Index, Arg::Index, Arg::Index, scalar], move |args| {
            let (col, row, k) = (args.index(0), args.index(1), args.index(2));
            let value = a.get([row, k]) * b.get([k, col]);
            args.update_scalar(3, |dot: f64| dot + value);
        })
    };
    let store = {
        let c = c.clone();
        Body::new([Arg::Index, Arg::Index, scalar], move |args| {
            let (col, row) = (args.index(0), args.index(1));
            c.set([row, col], args.scalar::<f64>(2));
        })
    };

    let point = |inner: fn(usize, Vec<Statement>) -> Statement| {
        inner(
            1,
            vec![inner(
                0,
                vec![
                    Statement::invoke(0, params([0])),
                    Statement::for_each(
                        2,
                        Policy::Seq,
                        [Statement::invoke(1, [segs([0, 1, 2]), params([0])].concat())],
                    ),
                    Statement::invoke(2, [segs([0, 1]), params([0])].concat()),
                ],
            )],
        )
    };
    let (tree, limits) = match backend {
        Backend::Gpu => {
            let tree = Statement::kernel([Statement::tile(
                1,
                TILE,
                Policy::Block(Axis::Y),
                Policy::ThreadLoop(Axis::Y),
                [Statement::tile(
                    0,
                    TILE,
                    Policy::Block(Axis::X),
                    Policy::ThreadLoop(Axis::X),
                    [point(|dim, children| Statement::inner(dim, children))],
                )],
            )]);
            // fewer threads than tile points, so every thread strides
            let limits = Limits {
                max_threads_per_block: 64,
                max_threads_per_axis: 8,
            };
            (tree, limits)
        }
        _ => {
            let tree = Statement::tile(
                1,
                TILE,
                Policy::Parallel,
                Policy::Seq,
                [Statement::tile(
                    0,
                    TILE,
                    Policy::Seq,
                    Policy::Seq,
                    [point(|dim, children| Statement::inner(dim, children))],
                )],
            );
            (tree, Limits::default())
        }
    };

    let engine = EngineBuilder::new()
        .backend(backend)
        .threads(4)
        .limits(limits)
        .build()?;
    let kernel = KernelBuilder::new((0..n, 0..n, 0..n))
        .param(Param::scalar(0.0f64))
        .bodies([init, accumulate, store])
        .tree([tree])
        .build(&engine)?;
    if backend == Backend::Gpu {
        assert_eq!(kernel.launches()[0].block, [8, 8, 1]);
    }
    kernel.execute();

    for (row, col) in iproduct!(0..n, 0..n) {
        assert_eq!(c.get([row, col]), (row * col * n) as f64, "{backend} at ({row}, {col})");
    }
    Ok(())
}

#[test]
fn test_mult3() -> Result<(), Box<dyn Error>> {
    for backend in BACKENDS {
        mult3(backend, 40)?;
    }
    Ok(())
}

#[test]
#[ignore = "expensive"]
fn test_mult3_full() -> Result<(), Box<dyn Error>> {
    for backend in BACKENDS {
        mult3(backend, 1000)?;
    }
    Ok(())
}

#[test]
fn test_strided_segments() -> Result<(), Box<dyn Error>> {
    let output = View::<u32>::new([64]);
    for backend in BACKENDS {
        output.fill(0);
        let body = {
            let output = output.clone();
            Body::new([Arg::Index], move |args| {
                output.update([args.index(0)], |x| x + 1);
            })
        };
        let (outer, inner) = match backend {
            Backend::Gpu => (Policy::Block(Axis::X), Policy::Thread(Axis::X)),
            _ => (Policy::Parallel, Policy::Seq),
        };
        let tile = Statement::tile(
            0,
            4,
            outer,
            inner,
            [Statement::inner(0, [Statement::invoke(0, segs([0]))])],
        );
        let tree = match backend {
            Backend::Gpu => Statement::kernel([tile]),
            _ => tile,
        };
        let space = IterationSpace::from(vec![Segment::new(3, 61, 5)?]);
        execute(&engine(backend)?, space, [tree], [], [body])?;

        for (index, value) in output.to_vec().into_iter().enumerate() {
            let expected = (index >= 3 && index < 61 && (index - 3) % 5 == 0) as u32;
            assert_eq!(value, expected, "{backend} at {index}");
        }
    }
    Ok(())
}

#[test]
fn test_guard() -> Result<(), Box<dyn Error>> {
    let engine = engine(Backend::Sequential)?;
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = View::<u32>::new([3, 4]);

    let body = {
        let (calls, seen) = (calls.clone(), seen.clone());
        Body::new([Arg::TileIndex, Arg::Offset], move |args| {
            calls.fetch_add(1, Ordering::Relaxed);
            seen.update([args.tile_index(0), args.offset(1)], |x| x + 1);
        })
    };
    let tree = |invoke: fn(usize, Vec<Binding>) -> Statement| {
        [Statement::tile(
            0,
            4,
            Policy::Seq,
            Policy::Seq,
            [Statement::inner(
                0,
                [invoke(0, vec![Binding::TileIndex(0), Binding::Offset(0)])],
            )],
        )]
    };

    execute(&engine, (0..10,), tree(|b, x| Statement::invoke(b, x)), [], [body.clone()])?;
    assert_eq!(calls.load(Ordering::Relaxed), 10);
    assert_eq!(seen.get([2, 1]), 1);
    assert_eq!(seen.get([2, 2]), 0);

    execute(&engine, (0..10,), tree(|b, x| Statement::invoke_always(b, x)), [], [body])?;
    assert_eq!(calls.load(Ordering::Relaxed), 22);
    assert_eq!(seen.get([2, 3]), 1);
    Ok(())
}

#[test]
fn test_nested_tiles() -> Result<(), Box<dyn Error>> {
    let engine = engine(Backend::Sequential)?;
    let output = View::<u32>::new([37]);
    let body = {
        let output = output.clone();
        Body::new([Arg::Index], move |args| output.update([args.index(0)], |x| x + 1))
    };
    let tree = [Statement::tile(
        0,
        10,
        Policy::Seq,
        Policy::Seq,
        [Statement::tile(
            0,
            4,
            Policy::Seq,
            Policy::Seq,
            [Statement::inner(0, [Statement::invoke(0, segs([0]))])],
        )],
    )];
    execute(&engine, (0..37,), tree, [], [body])?;
    assert!(output.to_vec().into_iter().all(|x| x == 1));
    Ok(())
}

#[test]
fn test_collapse() -> Result<(), Box<dyn Error>> {
    let (rows, cols) = (13, 29);
    for backend in [Backend::Sequential, Backend::HostParallel] {
        let output = View::<i64>::new([rows, cols]);
        let body = {
            let output = output.clone();
            Body::new([Arg::Index, Arg::Index, Arg::Offset], move |args| {
                let (row, col) = (args.index(0), args.index(1));
                output.update([row, col], |x| x + (row * cols + col) as i64 + args.offset(2) as i64);
            })
        };
        let tree = [Statement::collapse(
            [0, 1],
            Policy::Parallel,
            [Statement::invoke(0, [segs([0, 1]), offsets([1])].concat())],
        )];
        execute(&engine(backend)?, (0..rows, 0..cols), tree, [], [body])?;

        for (row, col) in iproduct!(0..rows, 0..cols) {
            let expected = (row * cols + col + col) as i64;
            assert_eq!(output.get([row, col]), expected, "{backend} at ({row}, {col})");
        }
    }
    Ok(())
}

#[test]
fn test_scalar_private_to_region() -> Result<(), Box<dyn Error>> {
    for backend in [Backend::Sequential, Backend::HostParallel] {
        let result = View::<i32>::new([1]);
        let write = Body::new([Arg::Scalar(DataType::I32)], |args| {
            args.update_scalar(0, |x: i32| x + 1)
        });
        let read = {
            let result = result.clone();
            Body::new([Arg::Scalar(DataType::I32)], move |args| {
                result.set([0], args.scalar::<i32>(0))
            })
        };
        let tree = [
            Statement::for_each(0, Policy::Parallel, [Statement::invoke(0, params([0]))]),
            Statement::invoke(1, params([0])),
        ];
        execute(&engine(backend)?, (0..100,), tree, [Param::scalar(0i32)], [write, read])?;

        match backend {
            Backend::HostParallel if cfg!(feature = "rayon") => assert_eq!(result.get([0]), 0),
            _ => assert_eq!(result.get([0]), 100),
        }
    }
    Ok(())
}

#[test]
fn test_tile_shared_across_region() -> Result<(), Box<dyn Error>> {
    let engine = engine(Backend::HostParallel)?;
    let sum = View::<u64>::new([1]);
    let write = Body::new([Arg::Index, Arg::Tile(DataType::U64)], |args| {
        let index = args.index(0);
        args.tile::<u64>(1).set([index], index as u64);
    });
    let read = {
        let sum = sum.clone();
        Body::new([Arg::Tile(DataType::U64)], move |args| {
            let tile = args.tile::<u64>(0);
            sum.set([0], (0..64).map(|index| tile.get([index])).sum());
        })
    };
    let tree = [Statement::stage(
        [0],
        Storage::Stack,
        [
            Statement::for_each(0, Policy::Parallel, [Statement::invoke(0, [Binding::Index(0), Binding::Param(0)])]),
            Statement::invoke(1, params([0])),
        ],
    )];
    execute(
        &engine,
        (0..64,),
        tree,
        [Param::tile(TileDecl::new::<u64>([64])?)],
        [write, read],
    )?;
    assert_eq!(sum.get([0]), (0..64).sum::<u64>());
    Ok(())
}

/// Every thread of one block writes its element of a shared tile and reads its neighbor's.
fn exchange(write_first: bool) -> Result<Vec<u32>, Box<dyn Error>> {
    let engine = EngineBuilder::new().backend(Backend::Gpu).build()?;
    let output = View::<u32>::new([32]);
    let write = Body::new([Arg::Index, Arg::Tile(DataType::U32)], |args| {
        let index = args.index(0);
        args.tile::<u32>(1).set([index], index as u32 + 1);
    });
    let read = {
        let output = output.clone();
        Body::new([Arg::Index, Arg::Tile(DataType::U32)], move |args| {
            let index = args.index(0);
            output.set([index], args.tile::<u32>(1).get([(index + 1) % 32]));
        })
    };
    let bindings = [Binding::Index(0), Binding::Param(0)];
    let phase = |body| {
        Statement::for_each(0, Policy::Thread(Axis::X), [Statement::invoke(body, bindings)])
    };
    let phases = if write_first {
        [phase(0), Statement::Sync, phase(1)]
    } else {
        [phase(1), Statement::Sync, phase(0)]
    };
    let tree = [Statement::kernel([Statement::stage(
        [0],
        Storage::Shared,
        phases,
    )])];
    execute(
        &engine,
        (0..32,),
        tree,
        [Param::tile(TileDecl::new::<u32>([32])?)],
        [write, read],
    )?;
    Ok(output.to_vec())
}

#[test]
fn test_barrier_orders_shared_tile() -> Result<(), Box<dyn Error>> {
    let expected = (0..32).map(|index| (index + 1) % 32 + 1).collect::<Vec<u32>>();
    assert_eq!(exchange(true)?, expected);

    // reads ordered before the barrier never observe the neighbors' writes
    let stale = exchange(false)?;
    assert_ne!(stale, expected);
    assert!(stale.iter().all(|&x| x == 0));
    Ok(())
}

#[test]
#[should_panic(expected = "boom")]
fn test_gpu_body_panic() {
    let engine = EngineBuilder::new().backend(Backend::Gpu).build();
    let body = Body::new([Arg::Index], |args| {
        if args.index(0) == 5 {
            panic!("boom");
        }
    });
    let tree = [Statement::kernel([Statement::for_each(
        0,
        Policy::Thread(Axis::X),
        [Statement::invoke(0, segs([0]))],
    )])];
    if let Ok(engine) = engine {
        let _ = execute(&engine, (0..8,), tree, [], [body]);
    }
}

#[test]
fn test_reject_before_running() -> Result<(), Box<dyn Error>> {
    let calls = Arc::new(AtomicUsize::new(0));
    let body = {
        let calls = calls.clone();
        Body::new([Arg::Index], move |_| {
            calls.fetch_add(1, Ordering::Relaxed);
        })
    };
    let engine = engine(Backend::Sequential)?;
    let tree = [
        Statement::for_each(0, Policy::Seq, [Statement::invoke(0, segs([0]))]),
        Statement::for_each(0, Policy::Seq, [Statement::invoke(1, segs([0]))]),
    ];
    let result = execute(&engine, (0..8,), tree, [], [body.clone()]);
    assert!(matches!(result, Err(KernelError::Body { body: 1, count: 1 })));
    assert_eq!(calls.load(Ordering::Relaxed), 0);

    let tree = [Statement::for_each(0, Policy::Seq, [Statement::invoke(0, segs([0]))])];
    let result = execute(&engine, (10..3,), tree.clone(), [], [body.clone()]);
    assert!(matches!(
        result,
        Err(KernelError::Space(SpaceError::Order { begin: 10, end: 3 }))
    ));
    assert_eq!(calls.load(Ordering::Relaxed), 0);

    // every body must be invoked by the tree
    let extra = Body::new([Arg::Index, Arg::Index, Arg::Offset], |_| {});
    let result = execute(&engine, (0..8,), tree, [], [body, extra]);
    assert!(matches!(result, Err(KernelError::Unused { body: 1, count: 2 })));
    assert_eq!(calls.load(Ordering::Relaxed), 0);

    assert!(matches!(
        EngineBuilder::new().threads(0).build(),
        Err(KernelError::Config(_))
    ));
    Ok(())
}

#[test]
fn test_engine() -> Result<(), Box<dyn Error>> {
    let engine = EngineBuilder::new()
        .backend(Backend::HostParallel)
        .threads(3)
        .build()?;
    assert_eq!(engine.backend(), Backend::HostParallel);
    #[cfg(feature = "rayon")]
    assert_eq!(engine.num_threads(), 3);

    let engine = EngineBuilder::new().build()?;
    assert_eq!(engine.backend(), Backend::Sequential);
    assert_eq!(engine.num_threads(), 1);
    assert_eq!(engine.limits(), Limits::default());
    Ok(())
}
