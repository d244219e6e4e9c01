//! The simplest possible coroutine: create one, resume it twice, observe it exit.
//!
//! No [`ef_coroutine::Runtime`] is needed for this — `Coroutine::create`/`resume`/`yield_now` work
//! standalone, resuming/yielding straight to/from whichever OS thread calls them.

use ef_coroutine::Coroutine;

fn main() {
    let mut coro = Coroutine::create(64 * 1024, 256, |first| {
        println!("1. hello from the coroutine, first resume sent {first}");

        let second = Coroutine::yield_now(42);
        println!("3. resumed again, sent back {second}");

        7
    })
    .expect("failed to create coroutine");

    let rcv = Coroutine::resume(&mut coro, 1).expect("first resume");
    println!("2. back in main, coroutine yielded {rcv}");

    let rcv = Coroutine::resume(&mut coro, 2).expect("second resume");
    println!("4. coroutine returned {rcv}");

    match Coroutine::resume(&mut coro, 3) {
        Err(e) => println!("5. resuming an exited coroutine fails as expected: {e}"),
        Ok(_) => unreachable!("an exited coroutine must never run again"),
    }
}
