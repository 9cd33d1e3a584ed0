//! Core domain model for the payroll open-data loader.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod parse;

pub use parse::{parse_row, ParseFailure};

/// One row of the published payroll table, exactly as found in the source file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRow {
    pub anio: String,
    pub mes: String,
    pub codigo_nivel: String,
    pub nivel_abr: String,
    pub descripcion_nivel: String,
    pub codigo_entidad: String,
    pub entidad_abr: String,
    pub descripcion_entidad: String,
    pub codigo_programa: String,
    pub programa_abr: String,
    pub descripcion_programa: String,
    pub codigo_subprograma: String,
    pub subprograma_abr: String,
    pub descripcion_subprograma: String,
    pub codigo_proyecto: String,
    pub proyecto_abr: String,
    pub descripcion_proyecto: String,
    pub codigo_unidad_responsable: String,
    pub unidad_abr: String,
    pub descripcion_unidad_responsable: String,
    pub codigo_objeto_gasto: String,
    pub concepto_gasto: String,
    pub fuente_financiamiento: String,
    pub linea: String,
    pub codigo_persona: String,
    pub nombres: String,
    pub apellidos: String,
    pub sexo: String,
    pub discapacidad: String,
    pub codigo_categoria: String,
    pub cargo: String,
    pub horas_catedra: String,
    pub fecha_ingreso: String,
    pub tipo_personal: String,
    pub lugar: String,
    pub monto_presupuestado: String,
    pub monto_devengado: String,
    pub mes_corte: String,
    pub anio_corte: String,
    pub fecha_corte: String,
}

/// Column names of the source table, in publication order.
pub const RAW_COLUMNS: [&str; 40] = [
    "anio",
    "mes",
    "codigoNivel",
    "nivelAbr",
    "descripcionNivel",
    "codigoEntidad",
    "entidadAbr",
    "descripcionEntidad",
    "codigoPrograma",
    "programaAbr",
    "descripcionPrograma",
    "codigoSubprograma",
    "subprogramaAbr",
    "descripcionSubprograma",
    "codigoProyecto",
    "proyectoAbr",
    "descripcionProyecto",
    "codigoUnidadResponsable",
    "unidadAbr",
    "descripcionUnidadResponsable",
    "codigoObjetoGasto",
    "conceptoGasto",
    "fuenteFinanciamiento",
    "linea",
    "codigoPersona",
    "nombres",
    "apellidos",
    "sexo",
    "discapacidad",
    "codigoCategoria",
    "cargo",
    "horasCatedra",
    "fechaIngreso",
    "tipoPersonal",
    "lugar",
    "montoPresupuestado",
    "montoDevengado",
    "mesCorte",
    "anioCorte",
    "fechaCorte",
];

/// Dimension entities expose the natural key they are deduplicated and upserted on.
pub trait Dimension: Clone + Eq {
    type Key: Ord + Clone;

    fn natural_key(&self) -> Self::Key;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Person {
    pub codigo_persona: String,
    pub nombres: String,
    pub apellidos: String,
    pub fecha_nacimiento: Option<NaiveDate>,
    pub sexo: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Level {
    pub nivel_key: String,
    pub codigo_nivel: String,
    pub nivel_abr: String,
    pub desc_nivel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Institution {
    pub entidad_key: String,
    pub codigo_entidad: String,
    pub entidad_abr: String,
    pub desc_entidad: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Program {
    pub programa_key: String,
    pub codigo_programa: String,
    pub codigo_sub_programa: String,
    pub programa_abr: String,
    pub sub_programa_abr: String,
    pub desc_programa: String,
    pub desc_sub_programa: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Project {
    pub proyecto_key: String,
    pub codigo_proyecto: String,
    pub proyecto_abr: String,
    pub desc_proyecto: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponsibleUnit {
    pub unidad_responsable_key: String,
    pub codigo_unidad_responsable: String,
    pub unidad_responsable_abr: String,
    pub desc_unidad_responsable: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpenseObject {
    pub codigo_objeto_gasto: i32,
    pub concepto_gasto: String,
}

impl Dimension for Person {
    type Key = String;

    fn natural_key(&self) -> String {
        self.codigo_persona.clone()
    }
}

impl Dimension for Level {
    type Key = String;

    fn natural_key(&self) -> String {
        self.nivel_key.clone()
    }
}

impl Dimension for Institution {
    type Key = String;

    fn natural_key(&self) -> String {
        self.entidad_key.clone()
    }
}

impl Dimension for Program {
    type Key = String;

    fn natural_key(&self) -> String {
        self.programa_key.clone()
    }
}

impl Dimension for Project {
    type Key = String;

    fn natural_key(&self) -> String {
        self.proyecto_key.clone()
    }
}

impl Dimension for ResponsibleUnit {
    type Key = String;

    fn natural_key(&self) -> String {
        self.unidad_responsable_key.clone()
    }
}

impl Dimension for ExpenseObject {
    type Key = i32;

    fn natural_key(&self) -> i32 {
        self.codigo_objeto_gasto
    }
}

/// One payroll line for a person in a month. The ordinal is assigned at persistence time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayrollEvent {
    pub codigo_evento: String,
    pub anio: i32,
    pub mes: i32,
    pub codigo_persona: String,
    pub discapacidad: bool,
    pub nivel_key: String,
    pub entidad_key: String,
    pub programa_key: String,
    pub proyecto_key: String,
    pub unidad_responsable_key: String,
    pub codigo_objeto_gasto: i32,
    pub fuente_financiamiento: String,
    pub linea: String,
    pub codigo_categoria: String,
    pub cargo: String,
    pub horas_catedra: i32,
    pub fecha_ingreso: Option<NaiveDate>,
    pub tipo_personal: String,
    pub lugar: String,
    pub monto_presupuestado: i64,
    pub monto_devengado: i64,
    pub anio_corte: i32,
    pub mes_corte: i32,
    pub fecha_corte: Option<NaiveDate>,
}

/// Everything a single raw row normalizes into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub person: Person,
    pub level: Level,
    pub institution: Institution,
    pub program: Program,
    pub project: Project,
    pub unit: ResponsibleUnit,
    pub expense_object: ExpenseObject,
    pub event: PayrollEvent,
}

/// Deduplicated dimensions plus the fact sequence for one period.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedBatch {
    pub persons: BTreeMap<String, Person>,
    pub levels: BTreeMap<String, Level>,
    pub institutions: BTreeMap<String, Institution>,
    pub programs: BTreeMap<String, Program>,
    pub projects: BTreeMap<String, Project>,
    pub units: BTreeMap<String, ResponsibleUnit>,
    pub expense_objects: BTreeMap<i32, ExpenseObject>,
    pub events: Vec<PayrollEvent>,
}

impl ProcessedBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Append-only record of one successfully ingested source archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub download_id: String,
    pub resource_url: String,
    pub check_sum: String,
    pub entries: i64,
    pub download_at_utc: DateTime<Utc>,
    pub was_succeed: bool,
}

/// Formats the sequential ledger identifier, e.g. `D0000042`.
pub fn ledger_download_id(sequence: u64) -> String {
    format!("D{sequence:07}")
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid period {0:?}, expected YYYY-MM")]
pub struct PeriodParseError(pub String);

/// A year-month ingestion unit; one source archive per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn current() -> Self {
        let today = Utc::now().date_naive();
        Self {
            year: today.year(),
            month: today.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Inclusive range of periods; empty when `from > to`.
    pub fn range(from: Period, to: Period) -> Vec<Period> {
        let mut out = Vec::new();
        let mut cursor = from;
        while cursor <= to {
            out.push(cursor);
            cursor = cursor.next();
        }
        out
    }

    /// Name of the table file inside the period archive.
    pub fn table_file_name(&self) -> String {
        format!("nomina_{self}.csv")
    }

    pub fn archive_file_name(&self) -> String {
        format!("nomina_{self}.zip")
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = PeriodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PeriodParseError(s.to_string());
        let (year, month) = s.trim().split_once('-').ok_or_else(err)?;
        if year.len() != 4 || month.is_empty() || month.len() > 2 {
            return Err(err());
        }
        let year: i32 = year.parse().map_err(|_| err())?;
        let month: u32 = month.parse().map_err(|_| err())?;
        Period::new(year, month).ok_or_else(err)
    }
}
