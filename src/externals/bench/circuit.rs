//! Linear network of the probe circuit.
//!
//! Every node has a capacitance to ground and the network follows
//! `C dv/dt = -G v + i`, `G` holding the DUT and whatever the pins connect,
//! `i` the currents fed by the driven pins. While the pins don't change the
//! solution is exact: `C = L L^T` gets factored once, `L^-1 G L^-T` is
//! symmetric and decomposes into independent exponential modes.

use std::collections::HashMap;

use thiserror::Error;

use crate::models::dut::Dut;

pub const NODES: usize = 5;
/// Node of the fixed reference capacitor.
pub const REF_NODE: usize = 3;
/// Node between the ESR and the plates of a capacitor DUT.
pub const DUT_NODE: usize = 4;
/// Capacitance keeping an unused DUT node well defined.
const IDLE_NODE_FARAD: f64 = 1e-9;
/// Jacobi sweeps before giving up on further accuracy.
const MAX_SWEEPS: usize = 64;

pub type Vector = [f64; NODES];
type Matrix = [[f64; NODES]; NODES];

#[derive(Error, Debug, PartialEq)]
pub enum CircuitError {
    #[error("Probe {0} doesn't exist")]
    InvalidProbe(usize),
    #[error("Both ends of the DUT are on probe {0}")]
    SameProbe(usize),
    #[error("Capacitances must be positive")]
    NotPositive,
}

/// Sources connected to the nodes, as conductance and current
/// (Norton equivalent).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Drive {
    pub conductance: Vector,
    pub current: Vector,
}

impl Drive {
    /// Connect `node` to a voltage source `volt` via `ohm`.
    pub fn connect(&mut self, node: usize, ohm: f64, volt: f64) {
        let g = 1.0 / ohm;
        self.conductance[node] += g;
        self.current[node] += g * volt;
    }

    fn key(&self) -> [u64; NODES] {
        self.conductance.map(f64::to_bits)
    }
}

/// Eigenmodes of the network for one set of conductances.
struct Modes {
    rates: Vector,
    to_modal: Matrix,
    from_modal: Matrix,
    inject: Matrix,
}

pub struct Circuit {
    chol_inv: Matrix,
    chol_t: Matrix,
    network: Matrix,
    voltages: Vector,
    modes: HashMap<[u64; NODES], Modes>,
}

impl Circuit {
    /// Network of three probes with `stray` capacitance each, the reference
    /// capacitor `ref_cap` and `dut` between probe `a` and `b`.
    pub fn new(dut: &Dut, a: usize, b: usize, stray: f64, ref_cap: f64) -> Result<Self, CircuitError> {
        for probe in [a, b] {
            if probe >= REF_NODE {
                return Err(CircuitError::InvalidProbe(probe));
            }
        }
        if a == b {
            return Err(CircuitError::SameProbe(a));
        }

        let mut capacitance = [[0.0; NODES]; NODES];
        let mut network = [[0.0; NODES]; NODES];
        for node in 0..REF_NODE {
            capacitance[node][node] = stray;
        }
        capacitance[REF_NODE][REF_NODE] = ref_cap;
        capacitance[DUT_NODE][DUT_NODE] = IDLE_NODE_FARAD;

        match *dut {
            Dut::Open => {}
            Dut::Resistor(ohm) => couple(&mut network, a, b, 1.0 / ohm),
            Dut::Capacitor {
                farad,
                esr,
                leakage,
            } => {
                capacitance[DUT_NODE][DUT_NODE] = 0.0;
                couple(&mut capacitance, DUT_NODE, b, farad);
                couple(&mut network, a, DUT_NODE, 1.0 / esr);
                if leakage.is_finite() {
                    couple(&mut network, a, b, 1.0 / leakage);
                }
            }
        }

        let chol = cholesky(&capacitance).ok_or(CircuitError::NotPositive)?;
        Ok(Self {
            chol_inv: lower_inverse(&chol),
            chol_t: transpose(&chol),
            network,
            voltages: [0.0; NODES],
            modes: HashMap::new(),
        })
    }

    pub fn voltage(&self, node: usize) -> f64 {
        self.voltages.get(node).copied().unwrap_or(0.0)
    }

    pub fn voltages(&self) -> Vector {
        self.voltages
    }

    pub fn set_voltages(&mut self, voltages: Vector) {
        self.voltages = voltages;
    }

    /// Let `dt` seconds pass with the sources of `drive`.
    pub fn step(&mut self, drive: &Drive, dt: f64) {
        let voltages = self.voltages;
        self.voltages = self.evolve(&voltages, drive, dt);
    }

    /// Node voltages `dt` seconds after `voltages`, leaving the state alone.
    pub fn evolve(&mut self, voltages: &Vector, drive: &Drive, dt: f64) -> Vector {
        if dt <= 0.0 {
            return *voltages;
        }
        let modes = self.modes_for(drive);

        let z = mat_vec(&modes.to_modal, voltages);
        let f = mat_vec(&modes.inject, &drive.current);
        let mut next = [0.0; NODES];
        for i in 0..NODES {
            let rate = modes.rates[i].max(0.0);
            let decay = (-rate * dt).exp();
            let gain = match rate > 0.0 {
                true => -(-rate * dt).exp_m1() / rate,
                false => dt,
            };
            next[i] = z[i] * decay + f[i] * gain;
        }
        mat_vec(&modes.from_modal, &next)
    }

    fn modes_for(&mut self, drive: &Drive) -> &Modes {
        let (chol_inv, chol_t, network) = (&self.chol_inv, &self.chol_t, &self.network);
        self.modes.entry(drive.key()).or_insert_with(|| {
            let mut g = *network;
            for i in 0..NODES {
                g[i][i] += drive.conductance[i];
            }
            let s = mat_mul(&mat_mul(chol_inv, &g), &transpose(chol_inv));
            let (rates, q) = jacobi(s);
            let q_t = transpose(&q);
            Modes {
                rates,
                to_modal: mat_mul(&q_t, chol_t),
                from_modal: mat_mul(&transpose(chol_inv), &q),
                inject: mat_mul(&q_t, chol_inv),
            }
        })
    }
}

/// Add an element of value `x` between node `a` and `b`.
fn couple(matrix: &mut Matrix, a: usize, b: usize, x: f64) {
    matrix[a][a] += x;
    matrix[b][b] += x;
    matrix[a][b] -= x;
    matrix[b][a] -= x;
}

fn transpose(m: &Matrix) -> Matrix {
    let mut t = [[0.0; NODES]; NODES];
    for i in 0..NODES {
        for j in 0..NODES {
            t[j][i] = m[i][j];
        }
    }
    t
}

fn mat_mul(a: &Matrix, b: &Matrix) -> Matrix {
    let mut c = [[0.0; NODES]; NODES];
    for i in 0..NODES {
        for j in 0..NODES {
            c[i][j] = (0..NODES).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    c
}

fn mat_vec(m: &Matrix, v: &Vector) -> Vector {
    let mut r = [0.0; NODES];
    for i in 0..NODES {
        r[i] = (0..NODES).map(|k| m[i][k] * v[k]).sum();
    }
    r
}

fn cholesky(c: &Matrix) -> Option<Matrix> {
    let mut l = [[0.0; NODES]; NODES];
    for i in 0..NODES {
        for j in 0..=i {
            let sum = c[i][j] - (0..j).map(|k| l[i][k] * l[j][k]).sum::<f64>();
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[i][i] = sum.sqrt();
            } else {
                l[i][j] = sum / l[j][j];
            }
        }
    }
    Some(l)
}

fn lower_inverse(l: &Matrix) -> Matrix {
    let mut inv = [[0.0; NODES]; NODES];
    for i in 0..NODES {
        inv[i][i] = 1.0 / l[i][i];
        for j in 0..i {
            let sum: f64 = (j..i).map(|k| l[i][k] * inv[k][j]).sum();
            inv[i][j] = -sum / l[i][i];
        }
    }
    inv
}

/// Eigenvalues and eigenvectors (columns) of the symmetric `a`, cyclic
/// Jacobi rotations.
fn jacobi(mut a: Matrix) -> (Vector, Matrix) {
    let mut q = [[0.0; NODES]; NODES];
    for (i, row) in q.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    for _ in 0..MAX_SWEEPS {
        let mut rotated = false;
        for p in 0..NODES {
            for r in p + 1..NODES {
                let apr = a[p][r];
                if apr == 0.0 {
                    continue;
                }
                // negligible against both diagonal entries
                if apr.abs() <= f64::EPSILON * 1e-3 * (a[p][p] * a[r][r]).abs().sqrt() {
                    a[p][r] = 0.0;
                    a[r][p] = 0.0;
                    continue;
                }
                rotated = true;

                let theta = (a[r][r] - a[p][p]) / (2.0 * apr);
                let t = match theta.abs() > 1e150 {
                    true => 0.5 / theta,
                    false => theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt()),
                };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..NODES {
                    let (akp, akr) = (a[k][p], a[k][r]);
                    a[k][p] = c * akp - s * akr;
                    a[k][r] = s * akp + c * akr;
                }
                for k in 0..NODES {
                    let (apk, ark) = (a[p][k], a[r][k]);
                    a[p][k] = c * apk - s * ark;
                    a[r][k] = s * apk + c * ark;
                }
                a[p][r] = 0.0;
                a[r][p] = 0.0;
                for row in q.iter_mut() {
                    let (qkp, qkr) = (row[p], row[r]);
                    row[p] = c * qkp - s * qkr;
                    row[r] = s * qkp + c * qkr;
                }
            }
        }
        if !rotated {
            break;
        }
    }

    let mut rates = [0.0; NODES];
    for i in 0..NODES {
        rates[i] = a[i][i];
    }
    (rates, q)
}
