//! Matrix transpose through a staged local tile, on every backend.

use std::error::Error;

use itertools::iproduct;
use weft::{
    Arg, Axis, Backend, Body, DataType, EngineBuilder, KernelBuilder, Policy, Statement, Storage,
    TileDecl, View, offsets, params, segs,
};

const ROWS: usize = 267;
const COLS: usize = 251;
const TILE: usize = 16;

fn tree(backend: Backend) -> Vec<Statement> {
    let bindings = [segs([0, 1]), offsets([0, 1]), params([0])].concat();
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
                    [0],
                    Storage::Shared,
                    [
                        Statement::inner(1, [Statement::inner(0, [load])]),
                        Statement::Sync,
                        Statement::for_each(
                            0,
                            Policy::Thread(Axis::Y),
                            [Statement::for_each(1, Policy::Thread(Axis::X), [store])],
                        ),
                    ],
                )],
            )],
        )])],
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
                    [0],
                    Storage::Stack,
                    [
                        // read rows of A contiguously
                        Statement::inner(1, [Statement::inner(0, [load])]),
                        // write rows of At contiguously
                        Statement::inner(0, [Statement::inner(1, [store])]),
                    ],
                )],
            )],
        )],
    }
}

fn check(at: &View<i32>) -> bool {
    iproduct!(0..COLS, 0..ROWS).all(|(row, col)| at.get([row, col]) == row as i32)
}

fn main() -> Result<(), Box<dyn Error>> {
    println!("\n\nshared matrix transpose example...");

    let a = View::<i32>::new([ROWS, COLS]);
    for (row, col) in iproduct!(0..ROWS, 0..COLS) {
        a.set([row, col], col as i32);
    }
    // column index has stride 1
    let at = View::<i32>::permuted([COLS, ROWS], [1, 0])?;

    let signature = [
        Arg::Index,
        Arg::Index,
        Arg::Offset,
        Arg::Offset,
        Arg::Tile(DataType::I32),
    ];
    let load = {
        let a = a.clone();
        Body::new(signature, move |args| {
            let (col, row) = (args.index(0), args.index(1));
            let (tx, ty) = (args.offset(2), args.offset(3));
            args.tile::<i32>(4).set([ty, tx], a.get([row, col]));
        })
    };
    let store = {
        let at = at.clone();
        Body::new(signature, move |args| {
            let (col, row) = (args.index(0), args.index(1));
            let (tx, ty) = (args.offset(2), args.offset(3));
            at.set([col, row], args.tile::<i32>(4).get([ty, tx]));
        })
    };

    for backend in [Backend::Sequential, Backend::HostParallel, Backend::Gpu] {
        println!("\n running {backend} shared matrix transpose...");
        at.fill(0);

        let engine = EngineBuilder::new().backend(backend).build()?;
        let kernel = KernelBuilder::new((0..COLS, 0..ROWS))
            .param(TileDecl::new::<i32>([TILE, TILE])?)
            .bodies([load.clone(), store.clone()])
            .tree(tree(backend))
            .build(&engine)?;
        for launch in kernel.launches() {
            println!("\t grid {:?}, block {:?}", launch.grid, launch.block);
        }
        kernel.execute();

        if check(&at) {
            println!("\n\t result -- PASS");
        } else {
            println!("\n\t result -- FAIL");
        }
    }

    println!("\n DONE!...");
    Ok(())
}
