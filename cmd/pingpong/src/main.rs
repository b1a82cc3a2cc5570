//! Ping-pong between two greenlets and the main greenlet
//!
//! # Environment Variables
//!
//! - `GREENLET_FLUSH_EPRINT=1` - Flush log output immediately
//! - `GREENLET_LOG_LEVEL=trace` - Show every switch (off, error, warn, info, debug, trace)
//! - `PINGPONG_ROUNDS=<n>` - Number of rounds (default 5)

use greenlet::{env_get, getcurrent, kinfo, thread_stats, Args, Failure, Greenlet, GreenletResult};

// GREENLET_LOG_LEVEL=trace cargo run -p greenlet-pingpong
fn main() -> GreenletResult<()> {
    println!("=== Greenlet Ping-Pong ===\n");

    let rounds: i64 = env_get("PINGPONG_ROUNDS", 5);
    let main = getcurrent()?;

    // `pong` answers every ping with ping + 1 and goes back to main.
    let m = main.clone();
    let pong = Greenlet::new(move |mut args| loop {
        let n = args.value::<i64>(0).unwrap_or(0);
        kinfo!("pong got {}", n);
        args = m.switch(Args::new().arg(n + 1))?;
    })?;

    // `ping` drives the rally and reports the final count to its parent.
    let p = pong.clone();
    let ping = Greenlet::new(move |args| {
        let rounds = args.value::<i64>(0).unwrap_or(0);
        let mut ball = 0i64;
        for _ in 0..rounds {
            let back = p.switch(Args::new().arg(ball))?;
            ball = back.value::<i64>(0).unwrap_or(ball);
        }
        Ok(Args::new().arg(ball).kwarg("rounds", rounds))
    })?;

    // pong returns to main after every hit; main hands the ball back to ping.
    let mut reply = ping.switch(Args::new().arg(rounds))?;
    while !ping.is_dead() {
        println!("main relays {:?}", reply.value::<i64>(0));
        reply = ping.switch(reply)?;
    }
    println!("\nfinal ball: {:?} after {:?} rounds", reply.value::<i64>(0), reply.kwarg_value::<i64>("rounds"));

    // pong is still parked in its loop; stop it.
    pong.throw(Failure::exit())?;
    println!("pong dead: {}", pong.is_dead());

    let stats = thread_stats()?;
    println!("switches={} started={} finished={}", stats.switches, stats.started, stats.finished);
    println!("\n=== Example Complete ===");
    Ok(())
}
