//! End-to-end tests against a real cluster. They need a reachable kubeconfig and, for the
//! install scenarios, `helm` on `PATH`. Run with `cargo test -p orkestra-e2e-tests --features e2e-test`.

#[cfg(all(test, feature = "e2e-test"))]
mod test;
