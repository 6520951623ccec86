//! Adapter for an external homotopy-continuation executable.
//!
//! Protocol: the system is written to a plain-text file whose first line
//! declares `<equations> <variables>`, followed by one polynomial per line as
//! a sum of `coefficient*name^power` terms terminated by `;`. The executable is
//! run as `<binary> <input> <output>` and the output is scanned for records of
//! the form `name : <real>E<exp> <imag>E<exp>`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use num_complex::Complex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::ComplexRootFinder;
use crate::error::{Result, VacuumError};
use crate::polynomial::{ConstraintSystem, PolynomialConstraint};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhcSettings {
    pub executable: PathBuf,
    /// Wall-clock limit for one invocation.
    pub timeout_seconds: f64,
    /// Variables are named `<prefix>1`, `<prefix>2`, ...
    pub variable_prefix: String,
    pub poll_interval_milliseconds: u64,
}

impl Default for PhcSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("phc"),
            timeout_seconds: 600.0,
            variable_prefix: "fv".to_string(),
            poll_interval_milliseconds: 20,
        }
    }
}

pub struct PhcProcess {
    settings: PhcSettings,
}

impl PhcProcess {
    pub fn new(settings: PhcSettings) -> Result<Self> {
        if !(settings.timeout_seconds > 0.0) {
            return Err(VacuumError::configuration(format!(
                "solver timeout must be positive, got {}",
                settings.timeout_seconds
            )));
        }
        if settings.variable_prefix.is_empty()
            || !settings
                .variable_prefix
                .chars()
                .all(|c| c.is_ascii_alphabetic())
        {
            return Err(VacuumError::configuration(format!(
                "variable prefix must be alphabetic, got {:?}",
                settings.variable_prefix
            )));
        }
        Ok(Self { settings })
    }

    pub fn variable_names(&self, number_of_fields: usize) -> Vec<String> {
        (1..=number_of_fields)
            .map(|i| format!("{}{}", self.settings.variable_prefix, i))
            .collect()
    }

    fn run(&self, input: &Path, output: &Path) -> Result<()> {
        let mut child = Command::new(&self.settings.executable)
            .arg(input)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                VacuumError::solver_failure(format!(
                    "could not start {}: {err}",
                    self.settings.executable.display()
                ))
            })?;

        let timeout = Duration::from_secs_f64(self.settings.timeout_seconds);
        let poll = Duration::from_millis(self.settings.poll_interval_milliseconds.max(1));
        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(VacuumError::solver_failure(format!(
                    "{} did not finish within {:.1} s",
                    self.settings.executable.display(),
                    self.settings.timeout_seconds
                )));
            }
            thread::sleep(poll);
        };

        if !status.success() {
            return Err(VacuumError::solver_failure(format!(
                "{} exited with {status}",
                self.settings.executable.display()
            )));
        }
        Ok(())
    }
}

impl ComplexRootFinder for PhcProcess {
    fn complex_roots(&mut self, system: &ConstraintSystem) -> Result<Vec<Vec<Complex<f64>>>> {
        let names = self.variable_names(system.number_of_fields());
        let workspace = tempfile::tempdir()?;
        let input = workspace.path().join("system.phc");
        let output = workspace.path().join("solutions.phc");
        fs::write(&input, format_system(system, &names))?;

        info!(
            executable = %self.settings.executable.display(),
            fields = system.number_of_fields(),
            "invoking external polynomial solver"
        );
        self.run(&input, &output)?;

        let text = fs::read_to_string(&output).map_err(|err| {
            VacuumError::solver_failure(format!("could not read solver output: {err}"))
        })?;
        let roots = parse_solutions(&text, &names);
        debug!(roots = roots.len(), "parsed external solver output");
        Ok(roots)
    }
}

/// Serializes the system in the external tool's polynomial syntax.
pub fn format_system(system: &ConstraintSystem, names: &[String]) -> String {
    let mut text = String::new();
    let n = system.number_of_fields();
    let _ = writeln!(text, "{n} {n}");
    for constraint in system.constraints() {
        let _ = writeln!(text, "{}", format_constraint(constraint, names));
    }
    text
}

fn format_constraint(constraint: &PolynomialConstraint, names: &[String]) -> String {
    let mut line = String::new();
    for term in constraint.terms.iter().filter(|term| term.coefficient != 0.0) {
        let _ = write!(line, " {:+.16E}", term.coefficient);
        for &(field, power) in &term.powers {
            if power == 1 {
                let _ = write!(line, "*{}", names[field]);
            } else {
                let _ = write!(line, "*{}^{}", names[field], power);
            }
        }
    }
    line.push(';');
    line
}

/// Extracts complete solution vectors from the solver's output. Records for
/// names that are not system variables (the continuation parameter, for
/// instance) are ignored; a block is complete once every variable was read.
pub fn parse_solutions(text: &str, names: &[String]) -> Vec<Vec<Complex<f64>>> {
    let index: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let mut solutions = Vec::new();
    let mut current: Vec<Option<Complex<f64>>> = vec![None; names.len()];
    for line in text.lines() {
        let Some((name, values)) = line.split_once(':') else {
            continue;
        };
        let Some(&field) = index.get(name.trim()) else {
            continue;
        };
        let mut numbers = values.split_whitespace().map(str::parse::<f64>);
        let (Some(Ok(re)), Some(Ok(im))) = (numbers.next(), numbers.next()) else {
            continue;
        };
        if current[field].is_some() {
            // A new block started before the previous one completed.
            current.iter_mut().for_each(|entry| *entry = None);
        }
        current[field] = Some(Complex::new(re, im));
        if current.iter().all(Option::is_some) {
            solutions.push(current.iter().map(|entry| entry.unwrap_or_default()).collect());
            current.iter_mut().for_each(|entry| *entry = None);
        }
    }
    solutions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polynomial::PolynomialTerm;

    fn small_system() -> ConstraintSystem {
        let first = PolynomialConstraint::new(vec![
            PolynomialTerm::new(2.0, &[(0, 2), (1, 1)]),
            PolynomialTerm::new(-1.5, &[]),
        ]);
        let second = PolynomialConstraint::new(vec![PolynomialTerm::new(1.0, &[(1, 1)])]);
        ConstraintSystem::new(2, vec![first, second]).expect("system")
    }

    fn names() -> Vec<String> {
        vec!["fv1".to_string(), "fv2".to_string()]
    }

    #[test]
    fn system_is_written_with_header_and_terminators() {
        let text = format_system(&small_system(), &names());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "2 2");
        assert!(lines[1].contains("*fv1^2*fv2"));
        assert!(lines[1].contains("-1.5000000000000000E0"));
        assert!(lines[1].ends_with(';'));
        assert!(lines[2].ends_with("*fv2;"));
    }

    #[test]
    fn solutions_are_parsed_by_variable_name() {
        let output = "\
solution 1 :    start residual :  0.000E+00   #iterations : 1   success
t :  1.00000000000000E+00   0.00000000000000E+00
m : 1
the solution for t :
 fv2 :  2.50000000000000E-01   0.00000000000000E+00
 fv1 : -1.00000000000000E+00   3.00000000000000E-17
== err :  1.0E-16 = rco :  1.0E-01 = res :  1.0E-16 ==
solution 2 :
 fv1 :  5.00000000000000E-01   1.00000000000000E+00
 fv2 :  0.00000000000000E+00  -1.00000000000000E+00
";
        let solutions = parse_solutions(output, &names());
        assert_eq!(solutions.len(), 2);
        assert_eq!(solutions[0][0], Complex::new(-1.0, 3e-17));
        assert_eq!(solutions[0][1], Complex::new(0.25, 0.0));
        assert_eq!(solutions[1][1], Complex::new(0.0, -1.0));
    }

    #[test]
    fn incomplete_blocks_are_dropped() {
        let output = " fv1 : 1.0E+00 0.0E+00\n fv1 : 2.0E+00 0.0E+00\n fv2 : 3.0E+00 0.0E+00\n";
        let solutions = parse_solutions(output, &names());
        assert_eq!(solutions.len(), 1);
        assert_eq!(solutions[0][0].re, 2.0);
    }

    #[test]
    fn bad_prefix_is_rejected() {
        let settings = PhcSettings {
            variable_prefix: "x_".to_string(),
            ..PhcSettings::default()
        };
        assert!(matches!(
            PhcProcess::new(settings),
            Err(VacuumError::Configuration(_))
        ));
    }

    #[test]
    fn missing_executable_is_a_solver_failure() {
        let settings = PhcSettings {
            executable: PathBuf::from("/nonexistent/solver-binary"),
            ..PhcSettings::default()
        };
        let mut process = PhcProcess::new(settings).expect("process");
        let err = process
            .complex_roots(&small_system())
            .expect_err("binary is missing");
        assert!(matches!(err, VacuumError::SolverFailure(_)));
    }

    #[cfg(unix)]
    fn script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-solver.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut permissions = fs::metadata(&path).expect("metadata").permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions).expect("chmod");
        path
    }

    #[cfg(unix)]
    #[test]
    fn fake_executable_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executable = script(
            dir.path(),
            "grep -q '^2 2$' \"$1\" || exit 3\nprintf ' fv1 : 1.0E+00 0.0E+00\\n fv2 : 0.0E+00 0.0E+00\\n' > \"$2\"",
        );
        let mut process = PhcProcess::new(PhcSettings {
            executable,
            timeout_seconds: 30.0,
            ..PhcSettings::default()
        })
        .expect("process");
        let roots = process.complex_roots(&small_system()).expect("roots");
        assert_eq!(roots, vec![vec![Complex::new(1.0, 0.0), Complex::new(0.0, 0.0)]]);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_a_solver_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executable = script(dir.path(), "exit 2");
        let mut process = PhcProcess::new(PhcSettings {
            executable,
            ..PhcSettings::default()
        })
        .expect("process");
        let err = process.complex_roots(&small_system()).expect_err("exit 2");
        assert!(err.to_string().contains("exited with"));
    }

    #[cfg(unix)]
    #[test]
    fn hung_solver_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executable = script(dir.path(), "sleep 10");
        let mut process = PhcProcess::new(PhcSettings {
            executable,
            timeout_seconds: 0.2,
            ..PhcSettings::default()
        })
        .expect("process");
        let started = Instant::now();
        let err = process.complex_roots(&small_system()).expect_err("timeout");
        assert!(err.to_string().contains("did not finish"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
