//! Elliptic-curve arithmetic over prime fields.
//!
//! Points are added and doubled in projective coordinates using the complete formulas by
//! Renes, Costello and Batina (2015, <https://eprint.iacr.org/2015/1060>), which need no special
//! cases for the point at infinity or for doubling.


pub mod curves;


use num_bigint::BigUint;
use num_traits::{One, Zero};
use zeroize::Zeroizing;

use crate::crypt::Error;


/// A point in affine coordinates.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AffinePoint {
    x: BigUint,
    y: BigUint,
}
impl AffinePoint {
    pub const fn new(x: BigUint, y: BigUint) -> Self {
        Self { x, y }
    }

    pub fn x(&self) -> &BigUint { &self.x }
    pub fn y(&self) -> &BigUint { &self.y }

    /// Serializes the point as `0x04 || x || y`, each coordinate left-padded to
    /// `bytes_per_component` bytes.
    pub fn to_be_bytes(&self, bytes_per_component: usize) -> Result<Zeroizing<Vec<u8>>, Error> {
        let mut ret = Zeroizing::new(Vec::with_capacity(1 + 2*bytes_per_component));
        ret.push(0x04); // uncompressed
        ret.extend(&*pad_be_bytes(&self.x, bytes_per_component)?);
        ret.extend(&*pad_be_bytes(&self.y, bytes_per_component)?);
        Ok(ret)
    }

    /// Decodes an uncompressed point `0x04 || x || y`.
    pub fn try_from_be_bytes(bytes: &[u8]) -> Option<Self> {
        let (&mode, coordinates) = bytes.split_first()?;
        if mode != 0x04 || coordinates.is_empty() || coordinates.len() % 2 != 0 {
            // compressed and hybrid forms are not supported
            return None;
        }
        let (x_bytes, y_bytes) = coordinates.split_at(coordinates.len() / 2);
        Some(Self {
            x: BigUint::from_bytes_be(x_bytes),
            y: BigUint::from_bytes_be(y_bytes),
        })
    }
}


/// Left-pads the big-endian representation of `value` with zeroes to `length` bytes.
pub fn pad_be_bytes(value: &BigUint, length: usize) -> Result<Zeroizing<Vec<u8>>, Error> {
    let bytes = Zeroizing::new(value.to_bytes_be());
    if value.is_zero() {
        return Ok(Zeroizing::new(vec![0u8; length]));
    }
    if bytes.len() > length {
        return Err(Error::ValueTooLong { maximum: length, obtained: bytes.len() });
    }
    let mut ret = Zeroizing::new(vec![0u8; length - bytes.len()]);
    ret.extend(&*bytes);
    Ok(ret)
}


/// Arithmetic modulo a prime.
#[derive(Clone, Debug)]
struct PrimeField<'p> {
    p: &'p BigUint,
}
impl<'p> PrimeField<'p> {
    fn add(&self, a: &BigUint, b: &BigUint) -> BigUint {
        (a + b) % self.p
    }

    fn sub(&self, a: &BigUint, b: &BigUint) -> BigUint {
        ((a + self.p) - b) % self.p
    }

    fn mul(&self, a: &BigUint, b: &BigUint) -> BigUint {
        (a * b) % self.p
    }

    /// Multiplicative inverse by Fermat's little theorem; zero maps to zero.
    fn invert(&self, a: &BigUint) -> BigUint {
        let exponent = self.p - 2u32;
        a.modpow(&exponent, self.p)
    }
}


/// A point in projective coordinates `(X : Y : Z)` with `x = X/Z` and `y = Y/Z`.
#[derive(Clone, Debug, Eq, PartialEq)]
struct ProjectivePoint {
    x: BigUint,
    y: BigUint,
    z: BigUint,
}
impl ProjectivePoint {
    fn infinity() -> Self {
        Self { x: BigUint::zero(), y: BigUint::one(), z: BigUint::zero() }
    }

    fn from_affine(point: &AffinePoint) -> Self {
        Self { x: point.x.clone(), y: point.y.clone(), z: BigUint::one() }
    }

    fn is_infinity(&self) -> bool {
        self.z.is_zero()
    }
}


/// An elliptic curve of the form `y**2 ≡ x**3 + ax + b` modulo a prime number.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PrimeWeierstrassCurve {
    /// The prime (modulus) of the curve.
    prime: BigUint,

    /// Coefficient `a` in the curve's formula.
    coefficient_a: BigUint,

    /// Coefficient `b` in the curve's formula.
    coefficient_b: BigUint,

    /// The coordinates of the generator point of the curve.
    generator: AffinePoint,

    /// The order of the generator point.
    order: BigUint,

    /// The cofactor of the curve.
    cofactor: u8,
}
impl PrimeWeierstrassCurve {
    pub fn new(
        prime: BigUint,
        coefficient_a: BigUint,
        coefficient_b: BigUint,
        generator: AffinePoint,
        order: BigUint,
        cofactor: u8,
    ) -> Result<Self, Error> {
        if !prime.bit(0) || prime <= BigUint::from(3u8) {
            return Err(Error::InvalidDomainParameters);
        }
        if coefficient_a >= prime || coefficient_b >= prime || order.is_zero() {
            return Err(Error::InvalidDomainParameters);
        }

        let curve = Self {
            prime,
            coefficient_a,
            coefficient_b,
            generator,
            order,
            cofactor,
        };
        if !curve.is_on_curve(&curve.generator) {
            return Err(Error::NotOnCurve);
        }
        Ok(curve)
    }

    pub fn prime(&self) -> &BigUint { &self.prime }
    pub fn coefficient_a(&self) -> &BigUint { &self.coefficient_a }
    pub fn coefficient_b(&self) -> &BigUint { &self.coefficient_b }
    pub fn generator(&self) -> &AffinePoint { &self.generator }
    pub fn order(&self) -> &BigUint { &self.order }
    pub fn cofactor(&self) -> u8 { self.cofactor }

    /// The number of bytes in an encoded field element (coordinate).
    pub fn coordinate_len_bytes(&self) -> usize {
        usize::try_from((self.prime.bits() + 7) / 8).unwrap_or(usize::MAX)
    }

    /// The number of bytes a private key on this curve should have.
    pub fn private_key_len_bytes(&self) -> usize {
        usize::try_from((self.order.bits() + 7) / 8).unwrap_or(usize::MAX)
    }

    fn field(&self) -> PrimeField<'_> {
        PrimeField { p: &self.prime }
    }

    pub fn is_on_curve(&self, point: &AffinePoint) -> bool {
        if point.x >= self.prime || point.y >= self.prime {
            return false;
        }
        let f = self.field();
        let lhs = f.mul(&point.y, &point.y);
        let x_cubed = f.mul(&f.mul(&point.x, &point.x), &point.x);
        let ax = f.mul(&self.coefficient_a, &point.x);
        let rhs = f.add(&f.add(&x_cubed, &ax), &self.coefficient_b);
        lhs == rhs
    }

    fn to_affine(&self, point: &ProjectivePoint) -> Option<AffinePoint> {
        if point.is_infinity() {
            return None;
        }
        let f = self.field();
        let z_inverse = f.invert(&point.z);
        Some(AffinePoint {
            x: f.mul(&point.x, &z_inverse),
            y: f.mul(&point.y, &z_inverse),
        })
    }

    fn b3(&self) -> BigUint {
        (&self.coefficient_b * 3u32) % &self.prime
    }

    fn add_projective(&self, lhs: &ProjectivePoint, rhs: &ProjectivePoint) -> ProjectivePoint {
        // RCB15 Algorithm 1; the numbers refer to the steps of the algorithm
        let f = self.field();
        let a = &self.coefficient_a;
        let b3 = self.b3();

        let mut t0 = f.mul(&lhs.x, &rhs.x); // 1
        let mut t1 = f.mul(&lhs.y, &rhs.y); // 2
        let mut t2 = f.mul(&lhs.z, &rhs.z); // 3
        let mut t3 = f.add(&lhs.x, &lhs.y); // 4
        let mut t4 = f.add(&rhs.x, &rhs.y); // 5
        t3 = f.mul(&t3, &t4); // 6
        t4 = f.add(&t0, &t1); // 7
        t3 = f.sub(&t3, &t4); // 8
        t4 = f.add(&lhs.x, &lhs.z); // 9
        let mut t5 = f.add(&rhs.x, &rhs.z); // 10
        t4 = f.mul(&t4, &t5); // 11
        t5 = f.add(&t0, &t2); // 12
        t4 = f.sub(&t4, &t5); // 13
        t5 = f.add(&lhs.y, &lhs.z); // 14
        let mut x3 = f.add(&rhs.y, &rhs.z); // 15
        t5 = f.mul(&t5, &x3); // 16
        x3 = f.add(&t1, &t2); // 17
        t5 = f.sub(&t5, &x3); // 18
        let mut z3 = f.mul(a, &t4); // 19
        x3 = f.mul(&b3, &t2); // 20
        z3 = f.add(&x3, &z3); // 21
        x3 = f.sub(&t1, &z3); // 22
        z3 = f.add(&t1, &z3); // 23
        let mut y3 = f.mul(&x3, &z3); // 24
        t1 = f.add(&t0, &t0); // 25
        t1 = f.add(&t1, &t0); // 26
        t2 = f.mul(a, &t2); // 27
        t4 = f.mul(&b3, &t4); // 28
        t1 = f.add(&t1, &t2); // 29
        t2 = f.sub(&t0, &t2); // 30
        t2 = f.mul(a, &t2); // 31
        t4 = f.add(&t4, &t2); // 32
        t0 = f.mul(&t1, &t4); // 33
        y3 = f.add(&y3, &t0); // 34
        t0 = f.mul(&t5, &t4); // 35
        x3 = f.mul(&t3, &x3); // 36
        x3 = f.sub(&x3, &t0); // 37
        t0 = f.mul(&t3, &t1); // 38
        z3 = f.mul(&t5, &z3); // 39
        z3 = f.add(&z3, &t0); // 40

        ProjectivePoint { x: x3, y: y3, z: z3 }
    }

    fn double_projective(&self, point: &ProjectivePoint) -> ProjectivePoint {
        // RCB15 Algorithm 3
        let f = self.field();
        let a = &self.coefficient_a;
        let b3 = self.b3();

        let mut t0 = f.mul(&point.x, &point.x); // 1
        let t1 = f.mul(&point.y, &point.y); // 2
        let mut t2 = f.mul(&point.z, &point.z); // 3
        let mut t3 = f.mul(&point.x, &point.y); // 4
        t3 = f.add(&t3, &t3); // 5
        let mut z3 = f.mul(&point.x, &point.z); // 6
        z3 = f.add(&z3, &z3); // 7
        let mut x3 = f.mul(a, &z3); // 8
        let mut y3 = f.mul(&b3, &t2); // 9
        y3 = f.add(&x3, &y3); // 10
        x3 = f.sub(&t1, &y3); // 11
        y3 = f.add(&t1, &y3); // 12
        y3 = f.mul(&x3, &y3); // 13
        x3 = f.mul(&t3, &x3); // 14
        z3 = f.mul(&b3, &z3); // 15
        t2 = f.mul(a, &t2); // 16
        t3 = f.sub(&t0, &t2); // 17
        t3 = f.mul(a, &t3); // 18
        t3 = f.add(&t3, &z3); // 19
        z3 = f.add(&t0, &t0); // 20
        t0 = f.add(&z3, &t0); // 21
        t0 = f.add(&t0, &t2); // 22
        t0 = f.mul(&t0, &t3); // 23
        y3 = f.add(&y3, &t0); // 24
        t2 = f.mul(&point.y, &point.z); // 25
        t2 = f.add(&t2, &t2); // 26
        t0 = f.mul(&t2, &t3); // 27
        x3 = f.sub(&x3, &t0); // 28
        z3 = f.mul(&t2, &t1); // 29
        z3 = f.add(&z3, &z3); // 30
        z3 = f.add(&z3, &z3); // 31

        ProjectivePoint { x: x3, y: y3, z: z3 }
    }

    fn multiply_projective(&self, scalar: &BigUint, point: &ProjectivePoint) -> ProjectivePoint {
        let mut result = ProjectivePoint::infinity();
        let mut double_me = point.clone();
        for i in 0..scalar.bits() {
            if scalar.bit(i) {
                result = self.add_projective(&result, &double_me);
            }
            double_me = self.double_projective(&double_me);
        }
        result
    }

    /// Multiplies a point with a scalar. Returns `None` if the result is the point at infinity.
    pub fn multiply(&self, scalar: &BigUint, point: &AffinePoint) -> Option<AffinePoint> {
        let product = self.multiply_projective(scalar, &ProjectivePoint::from_affine(point));
        self.to_affine(&product)
    }

    /// Adds two points. Returns `None` if the result is the point at infinity.
    pub fn add(&self, lhs: &AffinePoint, rhs: &AffinePoint) -> Option<AffinePoint> {
        let sum = self.add_projective(
            &ProjectivePoint::from_affine(lhs),
            &ProjectivePoint::from_affine(rhs),
        );
        self.to_affine(&sum)
    }

    /// Calculates a public key from a private key.
    pub fn calculate_public_key(&self, private_key: &BigUint) -> Result<AffinePoint, Error> {
        // public_key = private_key * generator
        self.multiply(private_key, &self.generator)
            .ok_or(Error::PointAtInfinity)
    }

    /// Calculates the shared point from our private key and the other party's public key.
    pub fn diffie_hellman(&self, private_key: &BigUint, other_public_key: &AffinePoint) -> Result<AffinePoint, Error> {
        // a public key off the curve could leak bits of our private key
        if !self.is_on_curve(other_public_key) {
            return Err(Error::NotOnCurve);
        }
        self.multiply(private_key, other_public_key)
            .ok_or(Error::PointAtInfinity)
    }

    /// Returns the session curve for generic mapping: the same curve with the generator
    /// `nonce * generator + shared_secret`.
    pub fn derive_generic_mapping_session_curve(&self, nonce: &BigUint, shared_secret: &AffinePoint) -> Result<Self, Error> {
        let generator = ProjectivePoint::from_affine(&self.generator);
        let product = self.multiply_projective(nonce, &generator);
        let sum = self.add_projective(&product, &ProjectivePoint::from_affine(shared_secret));
        let new_generator = self.to_affine(&sum)
            .ok_or(Error::PointAtInfinity)?;

        Ok(Self {
            generator: new_generator,
            ..self.clone()
        })
    }
}
