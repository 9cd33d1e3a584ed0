//! Row normalization: one raw payroll row into its dimension and fact entities.

use chrono::NaiveDate;
use thiserror::Error;

use crate::{
    ExpenseObject, Institution, Level, ParsedRecord, PayrollEvent, Person, Program, Project,
    RawRow, ResponsibleUnit,
};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("column {column} is not a valid integer: {value:?}")]
    InvalidNumber { column: &'static str, value: String },
}

/// Maps a raw row into its normalized entities.
///
/// Malformed dates are tolerated and become `None`; any other malformed numeric
/// column rejects the whole row.
pub fn parse_row(raw: &RawRow) -> Result<ParsedRecord, ParseFailure> {
    let anio: i32 = parse_int("anio", &raw.anio)?;
    let mes: i32 = parse_int("mes", &raw.mes)?;
    let codigo_persona = raw.codigo_persona.trim().to_string();

    let person = Person {
        codigo_persona: codigo_persona.clone(),
        nombres: raw.nombres.trim().to_string(),
        apellidos: raw.apellidos.trim().to_string(),
        fecha_nacimiento: None,
        sexo: sex_label(&raw.sexo).to_string(),
    };

    let level = Level {
        nivel_key: join_key(&[&raw.codigo_nivel, &raw.nivel_abr]),
        codigo_nivel: raw.codigo_nivel.trim().to_string(),
        nivel_abr: raw.nivel_abr.trim().to_string(),
        desc_nivel: raw.descripcion_nivel.trim().to_string(),
    };

    let institution = Institution {
        entidad_key: join_key(&[&raw.codigo_entidad, &raw.entidad_abr]),
        codigo_entidad: raw.codigo_entidad.trim().to_string(),
        entidad_abr: raw.entidad_abr.trim().to_string(),
        desc_entidad: raw.descripcion_entidad.trim().to_string(),
    };

    let program = Program {
        programa_key: join_key(&[
            &raw.codigo_programa,
            &raw.codigo_subprograma,
            &raw.programa_abr,
            &raw.subprograma_abr,
        ]),
        codigo_programa: raw.codigo_programa.trim().to_string(),
        codigo_sub_programa: raw.codigo_subprograma.trim().to_string(),
        programa_abr: raw.programa_abr.trim().to_string(),
        sub_programa_abr: raw.subprograma_abr.trim().to_string(),
        desc_programa: raw.descripcion_programa.trim().to_string(),
        desc_sub_programa: raw.descripcion_subprograma.trim().to_string(),
    };

    let project = Project {
        proyecto_key: join_key(&[&raw.codigo_proyecto, &raw.proyecto_abr]),
        codigo_proyecto: raw.codigo_proyecto.trim().to_string(),
        proyecto_abr: raw.proyecto_abr.trim().to_string(),
        desc_proyecto: raw.descripcion_proyecto.trim().to_string(),
    };

    let unit = ResponsibleUnit {
        unidad_responsable_key: join_key(&[&raw.codigo_unidad_responsable, &raw.unidad_abr]),
        codigo_unidad_responsable: raw.codigo_unidad_responsable.trim().to_string(),
        unidad_responsable_abr: raw.unidad_abr.trim().to_string(),
        desc_unidad_responsable: raw.descripcion_unidad_responsable.trim().to_string(),
    };

    let codigo_objeto_gasto: i32 = parse_int("codigoObjetoGasto", &raw.codigo_objeto_gasto)?;
    let expense_object = ExpenseObject {
        codigo_objeto_gasto,
        concepto_gasto: raw.concepto_gasto.trim().to_string(),
    };

    let horas_catedra: i32 = if raw.horas_catedra.trim().is_empty() {
        0
    } else {
        parse_int("horasCatedra", &raw.horas_catedra)?
    };

    let event = PayrollEvent {
        codigo_evento: format!("{anio}{mes:02}-{codigo_persona}"),
        anio,
        mes,
        codigo_persona,
        discapacidad: raw.discapacidad.trim() == "Y",
        nivel_key: level.nivel_key.clone(),
        entidad_key: institution.entidad_key.clone(),
        programa_key: program.programa_key.clone(),
        proyecto_key: project.proyecto_key.clone(),
        unidad_responsable_key: unit.unidad_responsable_key.clone(),
        codigo_objeto_gasto,
        fuente_financiamiento: raw.fuente_financiamiento.trim().to_string(),
        linea: raw.linea.trim().to_string(),
        codigo_categoria: raw.codigo_categoria.trim().to_string(),
        cargo: raw.cargo.trim().to_string(),
        horas_catedra,
        fecha_ingreso: parse_date(&raw.fecha_ingreso),
        tipo_personal: raw.tipo_personal.trim().to_string(),
        lugar: raw.lugar.trim().to_string(),
        monto_presupuestado: parse_int("montoPresupuestado", &raw.monto_presupuestado)?,
        monto_devengado: parse_int("montoDevengado", &raw.monto_devengado)?,
        anio_corte: parse_int("anioCorte", &raw.anio_corte)?,
        mes_corte: parse_int("mesCorte", &raw.mes_corte)?,
        fecha_corte: parse_date(&raw.fecha_corte),
    };

    Ok(ParsedRecord {
        person,
        level,
        institution,
        program,
        project,
        unit,
        expense_object,
        event,
    })
}

pub fn sex_label(code: &str) -> &'static str {
    match code.trim() {
        "F" => "Femenino",
        "M" => "Masculino",
        _ => "Otros",
    }
}

fn join_key(parts: &[&str]) -> String {
    parts.iter().map(|p| p.trim()).collect::<Vec<_>>().join("-")
}

fn parse_int<T: std::str::FromStr>(column: &'static str, value: &str) -> Result<T, ParseFailure> {
    value
        .trim()
        .parse()
        .map_err(|_| ParseFailure::InvalidNumber {
            column,
            value: value.to_string(),
        })
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}
