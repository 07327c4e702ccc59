//! Flat-text metrics exposition.
//!
//! One `name{label="value"} number` line per metric, no HELP/TYPE
//! preamble. Worker metrics are labeled by port, user counters by user.

use std::fmt::Write;

use herd_pool::WorkerSnapshot;

/// Render worker and user metrics into the flat text format.
pub fn render_metrics(workers: &[WorkerSnapshot], users: &[(String, u64)]) -> String {
    let mut out = String::new();

    for w in workers {
        let _ = writeln!(
            out,
            "ollama_instance_up{{port=\"{}\"}} {}",
            w.port,
            u8::from(w.alive)
        );
    }
    for w in workers {
        let _ = writeln!(
            out,
            "ollama_instance_requests_inflight{{port=\"{}\"}} {}",
            w.port, w.inflight
        );
    }
    for w in workers {
        let _ = writeln!(
            out,
            "ollama_instance_cpu{{port=\"{}\"}} {:.2}",
            w.port, w.cpu_percent
        );
    }
    for w in workers {
        let _ = writeln!(
            out,
            "ollama_instance_memory_mb{{port=\"{}\"}} {:.2}",
            w.port, w.memory_mb
        );
    }
    for w in workers {
        let _ = writeln!(
            out,
            "ollama_instance_load{{port=\"{}\"}} {:.4}",
            w.port, w.moving_average_load
        );
    }
    for w in workers {
        let _ = writeln!(
            out,
            "ollama_instance_composite_load{{port=\"{}\"}} {:.4}",
            w.port, w.composite_load
        );
    }
    for w in workers {
        let _ = writeln!(
            out,
            "ollama_instance_rps{{port=\"{}\"}} {:.2}",
            w.port, w.rps
        );
    }

    for (user, count) in users {
        let _ = writeln!(out, "ollama_user_requests{{user=\"{user}\"}} {count}");
    }

    out
}
